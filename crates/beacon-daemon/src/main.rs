//! # beacon-daemon
//!
//! Headless Beacon node. Connects a [`Gateway`] with the configured identity
//! and provider, creates the configured channels and logs connection,
//! message and emergency events until Ctrl+C.

mod channels;
mod config;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use beacon_gateway::{EmergencyEvent, Gateway, GatewayConfig, NetworkFactory};
use beacon_shared::InboundEvent;
use beacon_store::Database;

use crate::channels::open_channel;
use crate::config::DaemonConfig;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,beacon_gateway=debug,beacon_net=debug")),
        )
        .init();

    info!("Starting Beacon daemon v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = GatewayConfig::from_env();
    let daemon = DaemonConfig::from_env();
    info!(?config, "Loaded gateway configuration");
    info!(identity = %daemon.identity_id, channels = daemon.channels.len(), "Loaded daemon configuration");

    // -----------------------------------------------------------------------
    // 3. Build the gateway and wire up event logging
    // -----------------------------------------------------------------------
    // The daemon always keeps its queue on disk; BEACON_QUEUE_DB overrides
    // the platform data directory.
    let provider = config.default_provider;
    let store = match &config.queue_db {
        Some(path) => Database::open_at(path)?,
        None => Database::open_default()?,
    };
    let factory = Arc::new(NetworkFactory::new(&config));
    let gateway = Gateway::with_store(config, factory, Some(store));

    gateway.on_connection_change(|event| {
        info!(provider = %event.provider, state = %event.state, ready = event.ready, "Connection changed");
    });
    gateway.on_emergency(|event| match event {
        EmergencyEvent::Declared(state) => warn!(
            reason = state.reason.as_deref().unwrap_or_default(),
            urgency = ?state.urgency,
            "Emergency declared"
        ),
        EmergencyEvent::Superseded { current, .. } => warn!(
            reason = current.reason.as_deref().unwrap_or_default(),
            urgency = ?current.urgency,
            "Emergency superseded"
        ),
        EmergencyEvent::Resolved(_) => info!("Emergency resolved"),
        EmergencyEvent::BroadcastDegraded(report) => error!(
            unavailable_fallbacks = ?report.unavailable_fallbacks,
            "Emergency broadcast did not reach every channel"
        ),
    });

    // -----------------------------------------------------------------------
    // 4. Connect and create channels
    // -----------------------------------------------------------------------
    // A failed first attempt is not fatal: the supervisor keeps retrying and
    // sends queue until it gets through.
    match gateway.connect(Some(provider), daemon.identity()).await {
        Ok(state) => info!(provider = %provider, state = %state, "Connected"),
        Err(e) => warn!(provider = %provider, error = %e, "Initial connect failed, retrying in background"),
    }

    for (kind, name) in &daemon.channels {
        match open_channel(&gateway, *kind, name).await {
            Ok(channel) => {
                info!(channel = %channel.id(), "Channel ready");
                let id = channel.id().clone();
                let subscribed = gateway
                    .on_message(channel.id().clone(), move |event| match event {
                        InboundEvent::Message(m) => {
                            info!(channel = %id, from = %m.sender_id, message_id = %m.id, "Message received")
                        }
                        InboundEvent::Receipt(r) => {
                            info!(channel = %id, message_id = %r.message_id, kind = ?r.kind, "Receipt received")
                        }
                        InboundEvent::Presence(p) => {
                            info!(channel = %id, member = %p.member_id, status = ?p.status, "Presence changed")
                        }
                    })
                    .await;
                if let Err(e) = subscribed {
                    warn!(error = %e, "Could not subscribe to channel");
                }
            }
            Err(e) => warn!(name = %name, kind = %kind, error = %e, "Could not create channel"),
        }
    }

    // -----------------------------------------------------------------------
    // 5. Run until Ctrl+C, logging status periodically
    // -----------------------------------------------------------------------
    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = status_tick.tick() => {
                match serde_json::to_string(&gateway.status()) {
                    Ok(status) => info!(%status, "Gateway status"),
                    Err(e) => warn!(error = %e, "Could not render status"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    gateway.disconnect().await?;
    gateway.shutdown().await?;
    Ok(())
}
