//! `rtsp-server` — standalone CLI front-end for the `rtsp` library.
//!
//! Converts CLI flags (and an optional TOML preferences file) into a
//! `rtsp::ServerConfig`, starts the server, and blocks until `SIGTERM` or
//! Ctrl-C. `SIGHUP` is acknowledged and logged but otherwise a no-op —
//! live preference reload is an admin-surface concern, out of scope here
//! (SPEC_FULL.md §6).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rtsp::{Server, ServerConfig};
use serde::Deserialize;

#[derive(Parser)]
#[command(
    name = "rtsp-server",
    about = "Standalone RTSP server for H.264 streams"
)]
struct Args {
    /// Bind address (host:port).
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Optional TOML preferences file supplying `ServerConfig` fields.
    /// CLI flags always take precedence over values loaded from here.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker thread count for periodic housekeeping tasks (C2).
    /// Defaults to the detected CPU count.
    #[arg(long)]
    workers: Option<usize>,
}

/// Shape of an optional `--config` TOML file: every field mirrors a
/// `ServerConfig` field and is applied only when present, so a partial
/// file overrides just the fields it names.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    public_host: Option<String>,
    public_port: Option<u16>,
    sdp_username: Option<String>,
    sdp_session_name: Option<String>,
    rtsp_session_timeout_secs: Option<u64>,
    worker_threads: Option<usize>,
    digest_realm: Option<String>,
    reflectable_override: Option<bool>,
    credentials: Option<HashMap<String, String>>,
}

impl FileConfig {
    fn load(path: &PathBuf) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("reading config file {}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| format!("parsing config file {}: {e}", path.display()))
    }

    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(v) = self.public_host {
            config.public_host = Some(v);
        }
        if let Some(v) = self.public_port {
            config.public_port = Some(v);
        }
        if let Some(v) = self.sdp_username {
            config.sdp_username = v;
        }
        if let Some(v) = self.sdp_session_name {
            config.sdp_session_name = v;
        }
        if let Some(v) = self.rtsp_session_timeout_secs {
            config.rtsp_session_timeout_secs = v;
        }
        if let Some(v) = self.worker_threads {
            config.worker_threads = v;
        }
        if let Some(v) = self.digest_realm {
            config.digest_realm = v;
        }
        if let Some(v) = self.reflectable_override {
            config.reflectable_override = v;
        }
        if let Some(v) = self.credentials {
            config.credentials = v;
        }
        config
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::default();
    if let Some(path) = &args.config {
        match FileConfig::load(path) {
            Ok(file_config) => config = file_config.apply(config),
            Err(e) => {
                eprintln!("config error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
    // CLI flags always win over the file.
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }

    let mut server = Server::with_config(&args.bind, config);

    if let Err(e) = server.start() {
        eprintln!("failed to start server: {e}");
        return ExitCode::FAILURE;
    }
    tracing::info!(bind = %args.bind, "rtsp-server started");

    let mut signals = match signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGHUP,
    ]) {
        Ok(signals) => signals,
        Err(e) => {
            eprintln!("failed to install signal handlers: {e}");
            return ExitCode::FAILURE;
        }
    };

    for signal in signals.forever() {
        match signal {
            signal_hook::consts::SIGHUP => {
                tracing::info!("SIGHUP received; live preference reload is out of scope, ignoring");
            }
            _ => {
                tracing::info!(signal, "shutdown signal received, draining sessions");
                break;
            }
        }
    }

    server.stop();
    ExitCode::SUCCESS
}
