pub mod api;
pub mod config;
pub mod hub;
pub mod server;

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use service::{Engine, EngineOptions, relay::RelayClient, stats::Stats, transport::Transport};
use tokio::net::{TcpListener, UdpSocket};

use crate::{config::Config, hub::Hub};

/// Brings the gateway up and runs it until a shutdown signal.
///
/// Split out of `main` so integration tests can start the whole server
/// in-process. Every fatal init condition (port in use, media relay
/// unreachable) errors out of here before anything is spawned
/// half-way.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    let stats = Arc::new(Stats::default());

    let mut engine = None;
    let mut events = None;
    if config.sip.enabled {
        let advertised = config.advertised_ip()?;
        let upstream = config.upstream_addr()?;

        let socket = Arc::new(
            UdpSocket::bind(("0.0.0.0", config.sip.local_port))
                .await
                .context("sip port bind failed")?,
        );

        let relay = RelayClient::new(config.relay_addr()?, stats.clone())
            .await
            .context("relay socket bind failed")?;
        relay.ping().await.context("media relay unreachable")?;

        let (built, receiver) = Engine::new(
            EngineOptions {
                domain: config.sip.domain.clone(),
                advertised,
                local_port: config.sip.local_port,
                upstream,
                max_sessions: config.sip.max_sessions,
                display_name: "WebRTC Gateway".to_string(),
            },
            Transport::new(socket.clone()),
            relay,
            stats.clone(),
        );

        let loop_engine = built.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run(socket, loop_engine).await {
                log::error!("sip receive loop stopped: err={}", e);
            }
        });

        engine = Some(built);
        events = Some(receiver);
    } else {
        log::info!("telephony gateway disabled, relaying browser signaling only");
    }

    if config.server.enable_ssl {
        log::warn!("ENABLE_SSL set: TLS termination is expected at the fronting listener");
    }

    let hub = Arc::new(Hub::new(engine.clone()));
    if let Some(receiver) = events {
        tokio::spawn(hub::forward_events(hub.clone(), receiver));
    }

    let listener = TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .context("http port bind failed")?;
    let state = Arc::new(api::AppState {
        config: config.clone(),
        hub,
        stats,
        engine: engine.clone(),
        uptime: Instant::now(),
    });
    tokio::spawn(async move {
        if let Err(e) = api::serve(listener, state).await {
            log::error!("http server stopped: err={}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");

    if let Some(engine) = engine {
        engine.shutdown().await;
    }
    Ok(())
}
