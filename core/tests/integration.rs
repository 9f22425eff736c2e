//! End-to-end scenario tests (SPEC_FULL.md §8 S1-S6, §10).
//!
//! Each scenario spawns a real [`Server`] on a fixed loopback port and
//! drives it with a raw [`TcpStream`], mirroring how an actual RTSP
//! client would see the wire protocol.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use rtsp::config::ServerConfig;
use rtsp::protocol::sdp;
use rtsp::rtp::RtpResender;
use rtsp::Server;

fn rtsp_request(stream: &mut TcpStream, request: &str) -> std::io::Result<String> {
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    // Parse Content-Length and read body if present
    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        if len > 0 {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body)?;
            response.push_str(&String::from_utf8_lossy(&body));
        }
    }

    Ok(response)
}

fn connect(bind_addr: &str) -> TcpStream {
    let addr = bind_addr.to_socket_addrs().unwrap().next().unwrap();
    let stream =
        TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect to server");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
        .set_write_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

fn session_header_value(resp: &str) -> &str {
    resp.lines()
        .find(|l| l.to_lowercase().starts_with("session:"))
        .and_then(|l| l.split(':').nth(1))
        .map(|v| v.trim().split(';').next().unwrap_or("").trim())
        .unwrap_or("")
}

fn status_line(resp: &str) -> &str {
    resp.lines().next().unwrap_or("")
}

/// S1/S2/S2c — OPTIONS, then SETUP/PLAY/TEARDOWN of a single-track file
/// using the spec-canonical `trackID=` control URI.
#[test]
fn full_handshake_options_describe_setup_play_teardown() {
    const TEST_BIND: &str = "127.0.0.1:18554";
    let mut server = Server::new(TEST_BIND);
    server.start().expect("server start");

    let mut stream = connect(TEST_BIND);
    let base_uri = format!("rtsp://{TEST_BIND}/stream");

    // S1: OPTIONS
    let opt_req = format!("OPTIONS {} RTSP/1.0\r\nCSeq: 1\r\n\r\n", base_uri);
    let opt_resp = rtsp_request(&mut stream, &opt_req).expect("OPTIONS response");
    assert!(
        opt_resp.starts_with("RTSP/1.0 200 OK"),
        "OPTIONS: expected 200 OK, got: {}",
        status_line(&opt_resp)
    );
    assert!(
        opt_resp.contains("Public:"),
        "OPTIONS: missing Public header"
    );

    // DESCRIBE
    let desc_req = format!(
        "DESCRIBE {} RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n",
        base_uri
    );
    let desc_resp = rtsp_request(&mut stream, &desc_req).expect("DESCRIBE response");
    assert!(
        desc_resp.starts_with("RTSP/1.0 200 OK"),
        "DESCRIBE: expected 200 OK, got: {}",
        status_line(&desc_resp)
    );
    assert!(
        desc_resp.contains("Content-Type: application/sdp"),
        "DESCRIBE: missing Content-Type application/sdp"
    );
    assert!(desc_resp.contains("v=0"), "DESCRIBE: SDP body missing v=0");
    assert!(
        desc_resp.contains("m=video"),
        "DESCRIBE: SDP body missing m=video"
    );
    assert!(
        desc_resp.contains("a=rtpmap:96 H264/90000"),
        "DESCRIBE: SDP missing H264 rtpmap"
    );
    assert!(
        desc_resp.contains("a=fmtp:96 packetization-mode=1"),
        "DESCRIBE: SDP missing fmtp packetization-mode=1"
    );

    // S2(a): SETUP using the spec-canonical trackID= control URI, not the
    // legacy /track1 form (that form is accepted too, but a literal
    // /trackID=1 must also parse — it previously did not).
    let setup_uri = format!("{}/trackID=1", base_uri);
    let setup_req = format!(
        "SETUP {} RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port=5000-5001\r\n\r\n",
        setup_uri
    );
    let setup_resp = rtsp_request(&mut stream, &setup_req).expect("SETUP response");
    assert!(
        setup_resp.starts_with("RTSP/1.0 200 OK"),
        "SETUP: expected 200 OK, got: {}",
        status_line(&setup_resp)
    );
    assert!(
        setup_resp.contains("Session:"),
        "SETUP: missing Session header"
    );
    assert!(
        setup_resp.contains("Transport:"),
        "SETUP: missing Transport header"
    );

    let session_id = session_header_value(&setup_resp).to_string();
    assert!(!session_id.is_empty(), "SETUP: could not parse Session id");

    let pairs_while_live = server.udp_pool().live_pair_count();
    assert!(
        pairs_while_live >= 1,
        "SETUP should have allocated at least one SocketPair"
    );

    // S2(b): PLAY
    let play_req = format!(
        "PLAY {} RTSP/1.0\r\nCSeq: 4\r\nSession: {}\r\n\r\n",
        base_uri, session_id
    );
    let play_resp = rtsp_request(&mut stream, &play_req).expect("PLAY response");
    assert!(
        play_resp.starts_with("RTSP/1.0 200 OK"),
        "PLAY: expected 200 OK, got: {}",
        status_line(&play_resp)
    );
    assert!(
        play_resp.contains("RTP-Info:"),
        "PLAY: missing RTP-Info header"
    );

    // S2(c): TEARDOWN releases the SocketPair within ~1s.
    let teardown_req = format!(
        "TEARDOWN {} RTSP/1.0\r\nCSeq: 5\r\nSession: {}\r\n\r\n",
        base_uri, session_id
    );
    let teardown_resp = rtsp_request(&mut stream, &teardown_req).expect("TEARDOWN response");
    assert!(
        teardown_resp.starts_with("RTSP/1.0 200 OK"),
        "TEARDOWN: expected 200 OK, got: {}",
        status_line(&teardown_resp)
    );

    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    loop {
        if server.udp_pool().live_pair_count() < pairs_while_live {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "TEARDOWN: SocketPair was not released within 1s"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    server.stop();
}

/// S3 — Digest challenge, correct response, then a second unauthenticated
/// request reusing the same challenge gets flagged stale.
#[test]
fn digest_challenge_response_and_stale_nonce() {
    const TEST_BIND: &str = "127.0.0.1:18555";
    let mut config = ServerConfig::default();
    config
        .credentials
        .insert("alice".to_string(), "wonderland".to_string());
    let mut server = Server::with_config(TEST_BIND, config);
    server.start().expect("server start");

    let uri = format!("rtsp://{TEST_BIND}/protected");
    let sdp_body = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=x\r\nt=0 0\r\nm=audio 0 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";

    // First ANNOUNCE (protected method), no credentials -> 401 with a nonce.
    let mut stream = connect(TEST_BIND);
    let req = format!(
        "ANNOUNCE {} RTSP/1.0\r\nCSeq: 1\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
        uri,
        sdp_body.len(),
        sdp_body
    );
    let resp = rtsp_request(&mut stream, &req).expect("first ANNOUNCE response");
    assert!(
        resp.starts_with("RTSP/1.0 401"),
        "expected 401 Unauthorized, got: {}",
        status_line(&resp)
    );
    let www_auth = resp
        .lines()
        .find(|l| l.to_lowercase().starts_with("www-authenticate:"))
        .expect("missing WWW-Authenticate header");
    assert!(www_auth.contains("Digest"), "challenge must be Digest");
    assert!(
        www_auth.contains("realm=\"Streaming Server\""),
        "challenge must carry the configured realm"
    );
    let nonce = www_auth
        .split("nonce=\"")
        .nth(1)
        .and_then(|s| s.split('"').next())
        .expect("missing nonce")
        .to_string();

    // Second ANNOUNCE with a correctly computed Digest response -> 200.
    let ha1 = rtsp::auth::calc_ha1("alice", "Streaming Server", "wonderland");
    let ha2 = rtsp::auth::calc_ha2("ANNOUNCE", &uri);
    let response = rtsp::auth::calc_request_digest(&ha1, &nonce, None, &ha2);
    let auth_header = format!(
        "Digest username=\"alice\", realm=\"Streaming Server\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\""
    );
    let req = format!(
        "ANNOUNCE {} RTSP/1.0\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nAuthorization: {}\r\nContent-Length: {}\r\n\r\n{}",
        uri,
        auth_header,
        sdp_body.len(),
        sdp_body
    );
    let resp = rtsp_request(&mut stream, &req).expect("authenticated ANNOUNCE response");
    assert!(
        resp.starts_with("RTSP/1.0 200 OK"),
        "expected 200 OK with correct Digest response, got: {}",
        status_line(&resp)
    );

    // Third request with no credentials again reuses the same challenge
    // nonce and is flagged stale on its 401.
    let req = format!(
        "ANNOUNCE {} RTSP/1.0\r\nCSeq: 3\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
        uri,
        sdp_body.len(),
        sdp_body
    );
    let resp = rtsp_request(&mut stream, &req).expect("third ANNOUNCE response");
    assert!(
        resp.starts_with("RTSP/1.0 401"),
        "expected 401 Unauthorized again, got: {}",
        status_line(&resp)
    );
    let www_auth = resp
        .lines()
        .find(|l| l.to_lowercase().starts_with("www-authenticate:"))
        .expect("missing WWW-Authenticate header");
    assert!(
        www_auth.contains("stale=true"),
        "second challenge after an already-issued nonce must be marked stale: {www_auth}"
    );

    server.stop();
}

/// S4 — Reliable-UDP retransmit queue accounting (C9, Testable Properties
/// 4-6): un-acked packets are resent within their RTO, acked packets
/// never come back, and packets past their age limit are expired rather
/// than resent.
#[test]
fn retransmit_scenario_resends_unacked_and_expires_stale() {
    let mut resender = RtpResender::new();

    // 100 packets, receiver acks every second one.
    for seq in 0u16..100 {
        resender.add_packet(seq, vec![0u8; 32], 5_000);
    }
    let acked: Vec<u16> = (0..100).step_by(2).collect();
    for &seq in &acked {
        assert!(resender.ack_packet(seq), "ack of a live sequence must hit");
    }

    assert_eq!(resender.outstanding_count(), 50);

    // Let the default RTO (floored at 600ms) elapse for the rest.
    std::thread::sleep(Duration::from_millis(650));
    let due = resender.resend_due();

    assert_eq!(due.len(), 50, "every un-acked packet must be resent once its RTO elapses");
    for (seq, _) in &due {
        assert!(!acked.contains(seq), "an acked packet must never be resent: {seq}");
    }
    assert_eq!(resender.expired_count(), 0, "nothing here should have aged out");

    // A packet with a tiny age limit is dropped as expired rather than resent.
    let mut short_lived = RtpResender::new();
    short_lived.add_packet(1, vec![0u8; 16], 20);
    std::thread::sleep(Duration::from_millis(60));
    let due = short_lived.resend_due();
    assert!(due.is_empty(), "an expired packet must never be resent");
    assert_eq!(short_lived.expired_count(), 1);
}

/// S4 (wire-level slice) — SETUP negotiates the retransmit extension and
/// echoes it back, matching `x-Retransmit: our-retransmit;window=32`.
#[test]
fn setup_negotiates_retransmit_extension() {
    const TEST_BIND: &str = "127.0.0.1:18556";
    let mut server = Server::new(TEST_BIND);
    server.start().expect("server start");

    let mut stream = connect(TEST_BIND);
    let uri = format!("rtsp://{TEST_BIND}/stream/trackID=1");
    let req = format!(
        "SETUP {} RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port=6000-6001\r\nx-Retransmit: our-retransmit;window=32\r\n\r\n",
        uri
    );
    let resp = rtsp_request(&mut stream, &req).expect("SETUP response");
    assert!(
        resp.starts_with("RTSP/1.0 200 OK"),
        "expected 200 OK, got: {}",
        status_line(&resp)
    );
    assert!(
        resp.contains("x-Retransmit: our-retransmit"),
        "SETUP must echo the negotiated retransmit extension"
    );

    server.stop();
}

/// S5 — Reflector fan-out: a broadcaster pushes a 2-track source via
/// ANNOUNCE+RECORD, two players SETUP+PLAY the same source, and both get
/// every packet a single `broadcast_rtp_packet` call sends while sharing
/// one SocketPair per track.
#[test]
fn reflector_fan_out_delivers_to_every_player() {
    const TEST_BIND: &str = "127.0.0.1:18557";
    let mut server = Server::new(TEST_BIND);
    server.start().expect("server start");

    let uri = format!("rtsp://{TEST_BIND}/live");
    let sdp_body = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=x\r\nt=0 0\r\nm=audio 0 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";

    // Broadcaster: ANNOUNCE, then SETUP+RECORD both tracks under one
    // aggregate session.
    let mut broadcaster = connect(TEST_BIND);
    let req = format!(
        "ANNOUNCE {} RTSP/1.0\r\nCSeq: 1\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
        uri,
        sdp_body.len(),
        sdp_body
    );
    let resp = rtsp_request(&mut broadcaster, &req).expect("ANNOUNCE response");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "ANNOUNCE: {}", status_line(&resp));

    let pairs_after_announce = server.udp_pool().live_pair_count();
    assert_eq!(
        pairs_after_announce, 2,
        "ANNOUNCE must bind exactly one SocketPair per track"
    );

    let setup1 = format!(
        "SETUP {}/trackID=1 RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP;unicast;client_port=7000-7001;mode=RECORD\r\n\r\n",
        uri
    );
    let resp = rtsp_request(&mut broadcaster, &setup1).expect("broadcaster SETUP track1");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "broadcaster SETUP track1: {}", status_line(&resp));
    let broadcaster_session = session_header_value(&resp).to_string();

    let setup2 = format!(
        "SETUP {}/trackID=2 RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\nTransport: RTP/AVP;unicast;client_port=7002-7003;mode=RECORD\r\n\r\n",
        uri, broadcaster_session
    );
    let resp = rtsp_request(&mut broadcaster, &setup2).expect("broadcaster SETUP track2");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "broadcaster SETUP track2: {}", status_line(&resp));

    let record = format!(
        "RECORD {} RTSP/1.0\r\nCSeq: 4\r\nSession: {}\r\n\r\n",
        uri, broadcaster_session
    );
    let resp = rtsp_request(&mut broadcaster, &record).expect("RECORD response");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "RECORD: {}", status_line(&resp));

    // Two players: SETUP+PLAY track1 of the same source.
    let player_port_1: u16 = 7100;
    let player_port_2: u16 = 7200;
    let player1_sock = UdpSocket::bind(("127.0.0.1", player_port_1)).expect("bind player1 recv socket");
    let player2_sock = UdpSocket::bind(("127.0.0.1", player_port_2)).expect("bind player2 recv socket");
    player1_sock.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    player2_sock.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

    let mut player1 = connect(TEST_BIND);
    let setup = format!(
        "SETUP {}/trackID=1 RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
        uri, player_port_1, player_port_1 + 1
    );
    let resp = rtsp_request(&mut player1, &setup).expect("player1 SETUP");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "player1 SETUP: {}", status_line(&resp));
    let player1_session = session_header_value(&resp).to_string();
    let player1_transport = resp
        .lines()
        .find(|l| l.to_lowercase().starts_with("transport:"))
        .unwrap()
        .to_string();

    let mut player2 = connect(TEST_BIND);
    let setup = format!(
        "SETUP {}/trackID=1 RTSP/1.0\r\nCSeq: 1\r\nTransport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
        uri, player_port_2, player_port_2 + 1
    );
    let resp = rtsp_request(&mut player2, &setup).expect("player2 SETUP");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "player2 SETUP: {}", status_line(&resp));
    let player2_session = session_header_value(&resp).to_string();
    let player2_transport = resp
        .lines()
        .find(|l| l.to_lowercase().starts_with("transport:"))
        .unwrap()
        .to_string();

    // Both players land on the same server-side port for track 1: one
    // SocketPair shared by broadcaster + both players, not one per SETUP.
    let server_port_of = |transport_header: &str| -> &str {
        transport_header
            .split("server_port=")
            .nth(1)
            .and_then(|s| s.split(|c| c == ';' || c == '\r').next())
            .unwrap()
    };
    assert_eq!(
        server_port_of(&player1_transport),
        server_port_of(&player2_transport),
        "both players must be bound to the same reflected track's SocketPair"
    );
    assert_eq!(
        server.udp_pool().live_pair_count(),
        pairs_after_announce,
        "players attaching to an existing reflector source must not allocate new SocketPairs"
    );

    let play1 = format!("PLAY {} RTSP/1.0\r\nCSeq: 2\r\nSession: {}\r\n\r\n", uri, player1_session);
    let resp = rtsp_request(&mut player1, &play1).expect("player1 PLAY");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "player1 PLAY: {}", status_line(&resp));

    let play2 = format!("PLAY {} RTSP/1.0\r\nCSeq: 2\r\nSession: {}\r\n\r\n", uri, player2_session);
    let resp = rtsp_request(&mut player2, &play2).expect("player2 PLAY");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "player2 PLAY: {}", status_line(&resp));

    // A single broadcast reaches both players.
    let payload = b"synthetic-rtp-packet";
    server
        .broadcast_rtp_packet(payload)
        .expect("broadcast_rtp_packet");

    let mut buf = [0u8; 64];
    let (n1, _) = player1_sock.recv_from(&mut buf).expect("player1 should receive the packet");
    assert_eq!(&buf[..n1], payload);
    let mut buf = [0u8; 64];
    let (n2, _) = player2_sock.recv_from(&mut buf).expect("player2 should receive the packet");
    assert_eq!(&buf[..n2], payload);

    // Stopping one player doesn't affect the other's delivery.
    let teardown = format!(
        "TEARDOWN {} RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
        uri, player2_session
    );
    let resp = rtsp_request(&mut player2, &teardown).expect("player2 TEARDOWN");
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "player2 TEARDOWN: {}", status_line(&resp));

    let payload2 = b"synthetic-rtp-packet-2";
    server
        .broadcast_rtp_packet(payload2)
        .expect("broadcast_rtp_packet after one player left");
    let mut buf = [0u8; 64];
    let (n1, _) = player1_sock
        .recv_from(&mut buf)
        .expect("remaining player1 should still receive packets");
    assert_eq!(&buf[..n1], payload2);

    server.stop();
}

/// S6 — SDP rewrite determinism on the literal spec example.
#[test]
fn sdp_canonicalize_matches_spec_example() {
    let input = "v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\ns=x\r\nc=IN IP4 9.9.9.9/15\r\nt=0 0\r\nm=audio 12345 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\nm=video 12347 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";

    let output = sdp::canonicalize(input).expect("canonicalize must accept valid SDP");

    let expected = "v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\ns=x\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\na=control:*\r\nm=audio 0 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\na=control:trackID=1\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:trackID=2\r\n";

    assert_eq!(output, expected);
    assert!(output.contains("c=IN IP4 0.0.0.0"));
    assert!(output.contains("a=control:*"));
    assert!(output.contains("m=audio 0 RTP/AVP 0"));
    assert!(output.contains("a=control:trackID=1"));
    assert!(output.contains("m=video 0 RTP/AVP 96"));
    assert!(output.contains("a=control:trackID=2"));
}
