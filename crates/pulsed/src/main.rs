//! pulsed: Pulse relay daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use pulse_core::config::PulseConfig;
use pulse_core::message::{derive_id, unix_millis};
use pulse_services::{HttpBackend, NodeSettings, RelayNode, SystemClock};

mod medium;
mod probe;

use medium::MulticastMedium;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PulseConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = PulseConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PulseConfig::default()
    });

    if config.node.device_id.is_empty() {
        let seed = std::env::var("HOSTNAME").unwrap_or_default();
        let id = derive_id(&seed, unix_millis(), "pulsed");
        config.node.device_id = format!("pulse-{}", &id[..8]);
        tracing::info!(device_id = %config.node.device_id, "no device id configured, generated one");
    }

    let interface = match std::env::args().nth(1) {
        Some(name) => name,
        None if !config.medium.interface.is_empty() => config.medium.interface.clone(),
        None => medium::default_interface()?,
    };
    tracing::info!(interface, device_id = %config.node.device_id, "pulsed starting");

    let interface_index = medium::if_index(&interface)?;
    let medium = Arc::new(MulticastMedium::bind(interface_index, config.medium.port)?);

    let backend = Arc::new(
        HttpBackend::new(&config.relay.backend_url, config.relay.backend_timeout())
            .context("failed to build backend client")?,
    );
    tracing::info!(url = %backend.base_url(), "backend configured");

    // Connectivity
    let (online_tx, online_rx) = watch::channel(false);
    let probe_target = probe::probe_target(&config.relay.backend_url)?;
    let probe_interval = config.relay.connectivity_probe();
    let probe_task = tokio::spawn(probe::probe_loop(probe_target, probe_interval, online_tx));

    // Relay node
    let node = RelayNode::spawn(
        NodeSettings::from_config(&config),
        medium.clone(),
        &*medium,
        backend,
        online_rx,
        Arc::new(SystemClock),
    )
    .context("failed to start relay node")?;

    let response_printer = node.on_response(|query_id, text| {
        tracing::info!(query_id, text, "response delivered");
    });

    // Announce ourselves once so neighbours learn about us
    if let Err(e) = node.announce_presence().await {
        tracing::warn!(error = %e, "initial presence announcement failed");
    }

    let api_task = {
        let state = pulse_api::ApiState::new(node.clone(), config.node.device_id.clone());
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = pulse_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c()  => tracing::info!("shutting down"),
        r = probe_task               => tracing::error!("connectivity probe exited: {:?}", r),
        r = api_task                 => tracing::error!("API server exited: {:?}", r),
        r = response_printer         => tracing::error!("response printer exited: {:?}", r),
    }

    node.shutdown().await;
    Ok(())
}
