//! Shard server entry point.
//!
//! Loads settings (optional TOML path as the first argument, environment
//! overrides otherwise), wires SIGINT/SIGTERM to the graceful shutdown
//! path, and runs the reactor in the foreground.

use std::sync::Arc;

use tracing::info;

use shardnet::config::Settings;
use shardnet::error::Result;
use shardnet::service::{shard, SessionHandoff};
use shardnet::utils::logging;

fn main() {
    if let Err(e) = run() {
        // the subscriber may not be installed yet, so go straight to stderr
        eprintln!("[FATAL] {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::from_file(path)?,
        None => Settings::from_env(),
    };

    logging::init(settings.logging.level());
    settings.validate_strict()?;

    let handoff = Arc::new(SessionHandoff::new());
    let store = Box::new(shard::MemoryStore::default());

    let (mut server, monitor) = shard::shard_server(&settings, handoff, store)?;
    if monitor.is_some() {
        info!(port = settings.monitor.port, "telemetry channel enabled");
    }

    let shutdown = server.shutdown_flag();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, shutdown.as_atomic())?;
    }

    server.run()
}
