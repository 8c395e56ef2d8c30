use std::sync::Arc;

use clap::Parser;
use serial_fanout_proxy::config;
use serial_fanout_proxy::control::{ControlSurface, EngineControlSurface, LogHub};
use serial_fanout_proxy::engine::ProxyEngine;
use serial_fanout_proxy::logger::Logger;

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let opts = config::CmdOptions::parse();
    let cfg = match config::load(opts) {
        Ok(cfg) => cfg,
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    };

    let logger = match Logger::new(cfg.log_packets, cfg.log_file.clone()) {
        Ok(logger) => logger,
        Err(err) => {
            log::error!("failed to open log file: {}", err);
            std::process::exit(1);
        }
    };

    let log_hub = LogHub::new();
    log_hub.install(&logger);

    let engine = ProxyEngine::new(cfg, logger);
    if let Err(err) = engine.start().await {
        log::error!("{}", err);
        std::process::exit(1);
    }

    // The control surface is exposed here so an embedder can reach
    // status/inject/list_clients/log subscriptions through one handle; this
    // crate doesn't bind a transport for it.
    let _control: Arc<dyn ControlSurface> = Arc::new(EngineControlSurface::new(engine.clone(), log_hub));

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, draining clients");
    engine.stop().await;
}

/// Waits for either Ctrl+C or SIGTERM, whichever arrives first.
async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
