pub mod archive;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod metrics_defs;
pub mod relay;
pub mod service;
pub mod upstream;

#[cfg(test)]
mod testutils;

use archive::Archive;
use errors::IngestRelayError;
use relay::IngestionRelay;
use service::{RELAY_PATH, RelayService};
use shared::admin_service::AdminService;
use shared::http::serve_listener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use upstream::Open311Client;

/// Builds the relay described by `config`.
pub fn build_relay(config: &config::Config) -> Result<IngestionRelay, IngestRelayError> {
    let upstream = Open311Client::new(config.upstream.timeout_secs.map(Duration::from_secs))?;
    let archive = config.archive.as_ref().map(Archive::from_config);

    Ok(IngestionRelay::new(
        upstream,
        config.upstream.url.clone(),
        archive,
    ))
}

/// Serves the relay and admin listeners until one fails or the process is
/// interrupted.
pub async fn run(config: config::Config) -> Result<(), IngestRelayError> {
    config.validate()?;
    let relay = build_relay(&config)?;

    match &config.archive {
        Some(archive) => tracing::info!(
            store = ?archive.store,
            extension = %archive.extension,
            "Archival enabled; pages are stored as JSON"
        ),
        None => tracing::info!("Archival disabled"),
    }

    let relay_listener =
        TcpListener::bind(format!("{}:{}", config.listener.host, config.listener.port)).await?;
    let admin_listener = TcpListener::bind(format!(
        "{}:{}",
        config.admin_listener.host, config.admin_listener.port
    ))
    .await?;

    let relay_addr = relay_listener.local_addr()?;
    let admin_addr = admin_listener.local_addr()?;
    tracing::info!(
        listener = %relay_addr,
        admin_listener = %admin_addr,
        path = RELAY_PATH,
        "open311 relay listening"
    );

    let ready = Arc::new(AtomicBool::new(false));
    let is_ready = ready.clone();
    let admin_service: AdminService<_, IngestRelayError> =
        AdminService::new(move || is_ready.load(Ordering::Relaxed));

    let relay_task = serve_listener(relay_listener, RelayService::new(relay));
    let admin_task = serve_listener(admin_listener, admin_service);
    ready.store(true, Ordering::Relaxed);

    tokio::select! {
        result = async { tokio::try_join!(relay_task, admin_task) } => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, shutting down");
        }
    }

    Ok(())
}
