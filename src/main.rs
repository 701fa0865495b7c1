//! Device state manager daemon (dsmed)
//!
//! Fuses condition bits (charger, alarm, thermal, USB-mount, battery,
//! emergency call, ...) into a single device [`State`](dsmed::engine::State)
//! and runlevel, drives the IPHB heartbeat socket and the lifeguard
//! process supervisor, and exposes a small observability API.
//!
//! Default bind: 127.0.0.1:8872
//! WebSocket: /events
//! REST API: /api/v1/*

use anyhow::Result;
use dsmed::api::AppState;
use dsmed::bus::Bus;
use dsmed::config::DsmeConfig;
use dsmed::engine::StateSnapshot;
use dsmed::tracing_layer::BusLogLayer;
use dsmed::{iphb, lifeguard, run_core};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(DsmeConfig::from_env());
    let bus = Bus::new();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .with(BusLogLayer::new(bus.clone()))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,dsmed=debug")),
        )
        .init();

    info!("starting device state manager daemon");
    info!(version = env!("CARGO_PKG_VERSION"), "dsmed");

    let bootstate = std::env::var("DSME_BOOTSTATE").unwrap_or_else(|_| "USER".to_string());
    let (snapshot_tx, snapshot_rx) = watch::channel(StateSnapshot {
        current: dsmed::engine::State::NotSet,
        runlevel: dsmed::engine::state_to_runlevel(dsmed::engine::State::NotSet),
        bits: dsmed::engine::ConditionBits::default(),
    });

    {
        let cfg = Arc::clone(&cfg);
        let bus = bus.clone();
        tokio::spawn(async move {
            run_core(cfg, bus, bootstate, snapshot_tx).await;
        });
    }

    {
        let cfg = Arc::clone(&cfg);
        let bus = bus.clone();
        tokio::spawn(async move {
            let mut server = iphb::IphbServer::new(Box::new(iphb::NullHeartbeatDevice));
            if let Err(e) = server.run(&cfg, &bus).await {
                error!(error = %e, "IPHB server exited");
            }
        });
    }

    {
        let cfg = Arc::clone(&cfg);
        let bus = bus.clone();
        tokio::spawn(async move {
            if let Err(e) = lifeguard::socket::run(&cfg, &bus).await {
                error!(error = %e, "lifeguard socket server exited");
            }
        });
    }

    let bind_addr = std::env::var("DSME_API_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8872".to_string())
        .parse::<SocketAddr>()?;

    let app_state = AppState {
        config: Arc::clone(&cfg),
        snapshot_rx,
        bus: bus.clone(),
        started_at: Instant::now(),
    };
    let app = dsmed::api::create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("dsmed API listening on http://{}", bind_addr);
    info!("WebSocket events: ws://{}/events", bind_addr);
    info!("Swagger UI: http://{}/swagger-ui", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
