use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod authority;
mod config;
mod controller;
mod dbus_interface;
mod rate_limiter;
mod session;

use authority::HttpAuthority;
use config::Config;
use controller::SessionController;
use dbus_interface::{LiveProofService, BUS_NAME, OBJECT_PATH};

/// How often finished sessions past their retention are dropped.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        authority = %config.authority_url,
        session_bus = config.session_bus,
        max_sessions = config.max_sessions,
        "liveproofd starting"
    );

    let authority = Arc::new(HttpAuthority::new(
        &config.authority_url,
        config.verify_timeout(),
    ));
    let controller = Arc::new(SessionController::new(&config, authority));

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let service = LiveProofService::new(config, Arc::clone(&controller));
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "liveproofd ready");

    let reaper = Arc::clone(&controller);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            reaper.reap().await;
        }
    });

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!(
        active_sessions = controller.active_sessions().await,
        "liveproofd shutting down"
    );

    Ok(())
}
