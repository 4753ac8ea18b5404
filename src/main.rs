//! fleetconf daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

mod backoff;
mod config;
mod controller;
mod debounce;
mod discovery;
mod emitter;
mod error;
mod platform;
mod render;
mod stream;
mod types;
mod watcher;

use backoff::Backoff;
use config::Config;
use controller::{shutdown_signal, Controller};
use emitter::ConfigEmitter;
use platform::CloudApi;
use render::NginxRenderer;
use stream::EventStreamClient;
use watcher::ConfWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    let auth = match cfg.credential() {
        Some(auth) => auth.to_string(),
        None => {
            eprintln!(
                "fleetconf doesn't have access to the platform API - give this service an API \
                 role (DOCKERCLOUD_AUTH or FLEETCONF_AUTH) for automatic backend reconfiguration"
            );
            std::process::exit(1);
        }
    };
    cfg.validate()?;
    info!(
        "Starting fleetconf: conf_path={} restrict_mode={} node={:?}",
        cfg.conf_path.display(),
        cfg.restrict_mode,
        cfg.node_fqdn
    );

    // Event stream client, checked before anything is written
    let client = EventStreamClient::new(
        cfg.stream_url.clone(),
        auth.clone(),
        Duration::from_secs(cfg.ping_interval_secs),
        Duration::from_secs(cfg.pong_timeout_secs),
        Backoff::new(
            Duration::from_millis(cfg.reconnect_base_ms),
            Duration::from_millis(cfg.reconnect_max_ms),
        ),
    )?;

    // Initial configuration
    let api = Arc::new(CloudApi::new(
        &cfg.api_url,
        &auth,
        Duration::from_secs(cfg.request_timeout_secs),
    )?);
    let emitter = ConfigEmitter::new(Box::new(NginxRenderer), cfg.reload_command()?);
    let mut controller = Controller::new(&cfg, api, emitter);
    controller.startup().await;

    // Config file watcher
    let (conf_watcher, file_rx) = ConfWatcher::new(&cfg.conf_path);
    let _watcher = match conf_watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            error!("Unable to watch {}: {}", cfg.conf_path.display(), e);
            None
        }
    };

    // Event stream
    let (stream_tx, stream_rx) = mpsc::channel(128);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stream_handle = tokio::spawn(async move {
        if let Err(e) = client.run(stream_tx, shutdown_rx).await {
            error!("Event stream failed: {}", e);
        }
    });

    controller.run(stream_rx, file_rx, shutdown_signal()).await;

    // Graceful Shutdown
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), stream_handle)
        .await
        .is_err()
    {
        warn!("Event stream did not close in time");
    }

    info!("Shutdown complete.");
    Ok(())
}
