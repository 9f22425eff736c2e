use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

pub use crate::config::ServerConfig;
use crate::error::{Result, RtspError};
use crate::media::h264::H264Packetizer;
use crate::mount::{DEFAULT_MOUNT_PATH, MountRegistry};
use crate::net::udp_pool::UdpSocketPool;
use crate::reflector::ReflectorRegistry;
use crate::session::SessionManager;
use crate::timeout::TimeoutTask;
use crate::transport::UdpTransport;
use crate::transport::tcp;

/// High-level RTSP server orchestrator.
///
/// Owns the session manager, mount registry, UDP transport, socket-pair
/// pool, shared idle-timeout task, and reflector registry. Delegates TCP
/// connection handling to [`transport::tcp`] and RTP delivery to
/// [`transport::UdpTransport`].
pub struct Server {
    session_manager: SessionManager,
    mounts: MountRegistry,
    running: Arc<AtomicBool>,
    bind_addr: String,
    udp: Option<UdpTransport>,
    udp_pool: Arc<UdpSocketPool>,
    timeout_task: TimeoutTask,
    reflectors: Arc<ReflectorRegistry>,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    /// Create a server with custom protocol/SDP configuration.
    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        let packetizer: Box<dyn crate::media::Packetizer> =
            Box::new(H264Packetizer::with_random_ssrc(96));
        Self::with_packetizer_and_config(bind_addr, packetizer, config)
    }

    /// Create a server with a custom packetizer (for H.265, etc.).
    pub fn with_packetizer(bind_addr: &str, packetizer: Box<dyn crate::media::Packetizer>) -> Self {
        Self::with_packetizer_and_config(bind_addr, packetizer, ServerConfig::default())
    }

    /// Create a server with a custom packetizer and protocol/SDP configuration.
    pub fn with_packetizer_and_config(
        bind_addr: &str,
        packetizer: Box<dyn crate::media::Packetizer>,
        config: ServerConfig,
    ) -> Self {
        let mounts = MountRegistry::new();
        mounts.add(DEFAULT_MOUNT_PATH, packetizer);
        mounts.set_default(DEFAULT_MOUNT_PATH);

        let config = Arc::new(config);
        let udp_pool = Arc::new(UdpSocketPool::with_port_range(config.udp_port_range.clone()));

        Self {
            session_manager: SessionManager::with_pool_and_timeout(
                udp_pool.clone(),
                config.rtsp_session_timeout_secs,
            ),
            mounts,
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            udp: None,
            udp_pool,
            timeout_task: TimeoutTask::new(),
            reflectors: Arc::new(ReflectorRegistry::new()),
            config,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        self.udp = Some(UdpTransport::bind()?);

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        let mounts = self.mounts.clone();
        let config = self.config.clone();
        let reflectors = self.reflectors.clone();
        let timeout_task = self.timeout_task.clone();
        let udp_pool = self.udp_pool.clone();

        tracing::info!(addr = %self.bind_addr, workers = config.worker_threads, "RTSP server listening");

        thread::spawn(move || {
            tcp::accept_loop(
                listener,
                session_manager,
                mounts,
                config,
                running,
                reflectors,
                timeout_task,
                udp_pool,
            );
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn send_rtp_packet(&self, session_id: &str, payload: &[u8]) -> Result<usize> {
        let udp = self.udp.as_ref().ok_or(RtspError::NotStarted)?;
        udp.send_to_session(&self.session_manager, session_id, payload)
    }

    pub fn broadcast_rtp_packet(&self, payload: &[u8]) -> Result<usize> {
        let udp = self.udp.as_ref().ok_or(RtspError::NotStarted)?;
        udp.broadcast(&self.session_manager, payload)
    }

    pub fn get_viewers(&self) -> Vec<Viewer> {
        self.session_manager
            .get_playing_sessions()
            .iter()
            .filter_map(|session| {
                session.get_transport().map(|transport| Viewer {
                    session_id: session.id.clone(),
                    uri: session.uri.clone(),
                    client_addr: transport.client_addr.to_string(),
                    client_rtp_port: transport.client_rtp_port,
                })
            })
            .collect()
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    /// Returns the server's mount registry (named stream endpoints).
    pub fn mounts(&self) -> &MountRegistry {
        &self.mounts
    }

    /// Returns the server's UDP socket-pair pool (C4), shared by every
    /// SETUP that allocates RTP/RTCP ports.
    pub fn udp_pool(&self) -> Arc<UdpSocketPool> {
        self.udp_pool.clone()
    }

    /// Returns the server's shared idle-timeout task (C14).
    pub fn timeout_task(&self) -> TimeoutTask {
        self.timeout_task.clone()
    }

    /// Returns the server's reflector registry (C12), used by push/RECORD
    /// sessions to fan a single ingest out to many players.
    pub fn reflectors(&self) -> Arc<ReflectorRegistry> {
        self.reflectors.clone()
    }

    /// Returns the server's protocol configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

/// Information about a connected viewer (client in PLAY state).
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub uri: String,
    pub client_addr: String,
    pub client_rtp_port: u16,
}
