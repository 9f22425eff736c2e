//! Reflector session (SPEC_FULL.md §4.12).
//!
//! A content-addressed multiplexer: one inbound media source (named by
//! `source_id`, typically the request path) fans out to N player
//! outputs. Grounded in
//! `original_source/EasyDarwin/APIModules/QTSSReflectorModule/ReflectorSession.cpp`'s
//! `AddOutput` bucket-retry allocation and its 20s housekeeping tick.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::EventRuntime;
use crate::net::udp_pool::{SocketPair, UdpSocketPool};
use crate::protocol::sdp::SourceInfo;

const HOUSEKEEPING_INTERVAL_MS: u64 = 20_000;
const OUTPUT_BUCKET_COUNT: usize = 32;

/// One consumer attached to a [`ReflectorSession`]: identified by an
/// opaque output id (typically the session id of the RTSP client playing
/// this source).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub id: String,
}

/// One media stream within a reflected source, owning its own socket
/// pair for relaying inbound packets to attached outputs.
pub struct ReflectorStream {
    pub track_id: u32,
    pub socket_pair: Arc<SocketPair>,
    bytes_relayed: Mutex<u64>,
}

impl ReflectorStream {
    fn bind(pool: &UdpSocketPool, local_ip: IpAddr) -> crate::error::Result<Self> {
        let socket_pair = pool.get_pair(local_ip, 0, std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)?;
        Ok(Self {
            track_id: 0,
            socket_pair,
            bytes_relayed: Mutex::new(0),
        })
    }

    pub fn bit_rate(&self) -> u64 {
        *self.bytes_relayed.lock() * 8
    }

    pub fn record_relayed_bytes(&self, count: u64) {
        *self.bytes_relayed.lock() += count;
    }
}

/// Whether `addr` is an acceptable reflection destination: multicast, or
/// a routable (non-loopback-unless-local) unicast address. When
/// `reflectable_override` is set, this check always passes — logged
/// every time it actually suppressed a rejection (SPEC_FULL.md §4.12,
/// DESIGN.md Open Question #1).
pub fn is_reflectable_addr(addr: IpAddr, reflectable_override: bool) -> bool {
    let reachable = match addr {
        IpAddr::V4(v4) => v4.is_multicast() || !v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_multicast() || !v6.is_unspecified(),
    };

    if reachable {
        return true;
    }
    if reflectable_override {
        tracing::warn!(%addr, "reflectable_override forced an unreachable destination through");
        return true;
    }
    false
}

/// One reflected source: N streams, each with its own output buckets.
///
/// The output-bucket invariant: a given [`Output`] occupies the *same*
/// bucket index across every stream in this session, so per-stream
/// iteration order stays aligned. `add_output` tries bucket indices in
/// order and rolls back on conflict (a stream whose bucket is already
/// occupied by a different output), matching the source's retry loop.
pub struct ReflectorSession {
    pub source_id: String,
    pub streams: Vec<ReflectorStream>,
    buckets: Mutex<Vec<Vec<Option<Output>>>>,
    eye_count: Mutex<usize>,
}

impl ReflectorSession {
    /// Create a session, binding one [`SocketPair`] per stream described
    /// by `source_info` via the shared [`UdpSocketPool`] (C4).
    pub fn setup(
        source_id: &str,
        source_info: &SourceInfo,
        pool: &UdpSocketPool,
        local_ip: IpAddr,
    ) -> crate::error::Result<Self> {
        let mut streams = Vec::with_capacity(source_info.streams.len());
        for stream_info in &source_info.streams {
            let mut stream = ReflectorStream::bind(pool, local_ip)?;
            stream.track_id = stream_info.track_id;
            streams.push(stream);
        }

        let buckets = vec![vec![None; OUTPUT_BUCKET_COUNT]; streams.len().max(1)];

        Ok(Self {
            source_id: source_id.to_string(),
            streams,
            buckets: Mutex::new(buckets),
            eye_count: Mutex::new(0),
        })
    }

    /// Attach `output` to every stream in this session at a shared bucket
    /// index. `is_client` increments the session's eye-count (viewer
    /// count distinct from relay-only outputs).
    pub fn add_output(&self, output: Output, is_client: bool) -> crate::error::Result<()> {
        let mut buckets = self.buckets.lock();
        if buckets.is_empty() {
            return Ok(());
        }

        'bucket: for bucket_idx in 0..OUTPUT_BUCKET_COUNT {
            for stream_buckets in buckets.iter() {
                if let Some(existing) = &stream_buckets[bucket_idx] {
                    if existing != &output {
                        continue 'bucket;
                    }
                }
            }
            for stream_buckets in buckets.iter_mut() {
                stream_buckets[bucket_idx] = Some(output.clone());
            }
            if is_client {
                *self.eye_count.lock() += 1;
            }
            tracing::debug!(source_id = %self.source_id, output_id = %output.id, bucket_idx, "output attached");
            return Ok(());
        }

        Err(crate::error::RtspError::Internal {
            component: "reflector",
            detail: format!("no free output bucket for source {}", self.source_id),
        })
    }

    /// Detach `output` from every stream bucket it occupies.
    pub fn remove_output(&self, output: &Output, is_client: bool) {
        let mut buckets = self.buckets.lock();
        for stream_buckets in buckets.iter_mut() {
            for slot in stream_buckets.iter_mut() {
                if slot.as_ref() == Some(output) {
                    *slot = None;
                }
            }
        }
        if is_client {
            let mut eyes = self.eye_count.lock();
            *eyes = eyes.saturating_sub(1);
        }
        tracing::debug!(source_id = %self.source_id, output_id = %output.id, "output detached");
    }

    pub fn eye_count(&self) -> usize {
        *self.eye_count.lock()
    }

    /// Sum of per-stream bit rates.
    pub fn bit_rate(&self) -> u64 {
        self.streams.iter().map(ReflectorStream::bit_rate).sum()
    }

    /// Number of outputs currently attached to at least one bucket.
    pub fn output_count(&self) -> usize {
        let buckets = self.buckets.lock();
        let Some(first) = buckets.first() else {
            return 0;
        };
        first.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Registry of live [`ReflectorSession`]s, keyed by source id.
///
/// Registration/lookup is serialized by a single mutex; per-output work
/// (add/remove on an already-created session) happens without holding
/// it, per SPEC_FULL.md §4.12's thread-safety note.
pub struct ReflectorRegistry {
    sessions: Mutex<HashMap<String, Arc<ReflectorSession>>>,
    _runtime: Arc<EventRuntime>,
}

impl ReflectorRegistry {
    pub fn new() -> Self {
        let registry = Self {
            sessions: Mutex::new(HashMap::new()),
            _runtime: EventRuntime::new(),
        };
        registry.spawn_housekeeping();
        registry
    }

    fn spawn_housekeeping(&self) {
        // Housekeeping has no state to evict yet beyond what TEARDOWN
        // already handles explicitly; the ticker exists so a future
        // stale-output sweep has a home without re-plumbing the runtime.
        self._runtime.spawn(HOUSEKEEPING_INTERVAL_MS, || {
            tracing::trace!("reflector housekeeping tick");
            Some(HOUSEKEEPING_INTERVAL_MS)
        });
    }

    /// Create (or return the existing) session for `source_id`.
    pub fn get_or_create(
        &self,
        source_id: &str,
        source_info: &SourceInfo,
        pool: &UdpSocketPool,
        local_ip: IpAddr,
    ) -> crate::error::Result<Arc<ReflectorSession>> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(source_id) {
            return Ok(existing.clone());
        }
        let session = Arc::new(ReflectorSession::setup(source_id, source_info, pool, local_ip)?);
        sessions.insert(source_id.to_string(), session.clone());
        Ok(session)
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<ReflectorSession>> {
        self.sessions.lock().get(source_id).cloned()
    }

    /// Remove a session (e.g. when its source disconnects), severing the
    /// registry's back-pointer.
    pub fn remove(&self, source_id: &str) -> Option<Arc<ReflectorSession>> {
        self.sessions.lock().remove(source_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReflectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sdp::{MediaKind, StreamInfo};
    use std::net::Ipv4Addr;

    fn sample_source_info() -> SourceInfo {
        SourceInfo {
            streams: vec![
                StreamInfo {
                    kind: MediaKind::Video,
                    payload_type: 96,
                    payload_name: Some("H264".to_string()),
                    is_tcp: false,
                    track_id: 1,
                    destination: None,
                    ttl: None,
                },
                StreamInfo {
                    kind: MediaKind::Audio,
                    payload_type: 97,
                    payload_name: Some("MPEG4-GENERIC".to_string()),
                    is_tcp: false,
                    track_id: 2,
                    destination: None,
                    ttl: None,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn setup_binds_one_socket_pair_per_stream() {
        let pool = UdpSocketPool::new();
        let info = sample_source_info();
        let session =
            ReflectorSession::setup("cam1", &info, &pool, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(session.streams.len(), 2);
        assert_ne!(
            session.streams[0].socket_pair.rtp_port,
            session.streams[1].socket_pair.rtp_port
        );
    }

    #[test]
    fn add_output_lands_in_same_bucket_across_streams() {
        let pool = UdpSocketPool::new();
        let info = sample_source_info();
        let session =
            ReflectorSession::setup("cam1", &info, &pool, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();

        session
            .add_output(Output { id: "viewer1".to_string() }, true)
            .unwrap();
        assert_eq!(session.eye_count(), 1);
        assert_eq!(session.output_count(), 1);
    }

    #[test]
    fn remove_output_frees_its_bucket_on_every_stream() {
        let pool = UdpSocketPool::new();
        let info = sample_source_info();
        let session =
            ReflectorSession::setup("cam1", &info, &pool, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();

        let output = Output { id: "viewer1".to_string() };
        session.add_output(output.clone(), true).unwrap();
        session.remove_output(&output, true);
        assert_eq!(session.eye_count(), 0);
        assert_eq!(session.output_count(), 0);
    }

    #[test]
    fn registry_get_or_create_is_idempotent() {
        let pool = UdpSocketPool::new();
        let registry = ReflectorRegistry::new();
        let info = sample_source_info();
        let a = registry
            .get_or_create("cam1", &info, &pool, IpAddr::V4(Ipv4Addr::LOCALHOST))
            .unwrap();
        let b = registry
            .get_or_create("cam1", &info, &pool, IpAddr::V4(Ipv4Addr::LOCALHOST))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn is_reflectable_rejects_unspecified_without_override() {
        let addr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        assert!(!is_reflectable_addr(addr, false));
        assert!(is_reflectable_addr(addr, true));
    }

    #[test]
    fn is_reflectable_accepts_multicast() {
        let addr = IpAddr::V4(Ipv4Addr::new(239, 1, 1, 1));
        assert!(is_reflectable_addr(addr, false));
    }
}
