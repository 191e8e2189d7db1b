//! Connection loop: accepts QUIC connections, dispatches streams to the
//! handler, and drains in-flight work on shutdown (spec §4.F).

pub mod tls;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quinn::{Endpoint, Incoming};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::auth::TokenTable;
use crate::codec::{read_request, Response};
use crate::handler::Handler;
use crate::rate_limit::RateLimiter;
use crate::status::Status;

/// How long shutdown waits for in-flight handlers to finish (spec §4.F).
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

pub struct ServerConfig {
    pub port: u16,
    pub max_streams: u32,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
}

pub async fn run(
    quinn_config: quinn::ServerConfig,
    cfg: ServerConfig,
    handler: Arc<Handler>,
    rate_limiter: Arc<RateLimiter>,
) -> anyhow::Result<()> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(cfg.max_streams.into());
    transport.max_idle_timeout(Some(cfg.idle_timeout.try_into()?));

    let mut quinn_config = quinn_config;
    quinn_config.transport_config(Arc::new(transport));

    let v4_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port));
    let endpoint = Endpoint::server(quinn_config, v4_addr)
        .with_context(|| format!("binding QUIC endpoint on {v4_addr}"))?;
    info!(addr = %v4_addr, "listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_rx = shutdown_rx.clone();
    tokio::spawn(rate_limiter.clone().run_eviction_sweep(sweep_rx));

    let mut join_set = tokio::task::JoinSet::new();

    tokio::select! {
        _ = accept_loop(&endpoint, handler.clone(), rate_limiter.clone(), cfg.request_timeout, &mut join_set) => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining");
        }
    }

    let _ = shutdown_tx.send(true);
    endpoint.close(0u32.into(), b"shutting down");

    let drained = timeout(DRAIN_DEADLINE, async {
        while join_set.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("drain deadline exceeded, exiting with handlers still in flight");
    }

    Ok(())
}

async fn accept_loop(
    endpoint: &Endpoint,
    handler: Arc<Handler>,
    rate_limiter: Arc<RateLimiter>,
    request_timeout: Duration,
    join_set: &mut tokio::task::JoinSet<()>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let handler = handler.clone();
        let rate_limiter = rate_limiter.clone();
        join_set.spawn(handle_connection(incoming, handler, rate_limiter, request_timeout));
    }
}

async fn handle_connection(
    incoming: Incoming,
    handler: Arc<Handler>,
    rate_limiter: Arc<RateLimiter>,
    request_timeout: Duration,
) {
    let connection = match incoming.await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "connection handshake failed");
            return;
        }
    };
    let source_host = connection.remote_address().ip().to_string();

    let mut streams = tokio::task::JoinSet::new();
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                if rate_limiter.enabled() && !rate_limiter.allow(&source_host) {
                    continue;
                }
                let handler = handler.clone();
                streams.spawn(handle_stream(send, recv, handler, request_timeout));
            }
            Err(_) => break,
        }
    }
    while streams.join_next().await.is_some() {}
}

async fn handle_stream(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    handler: Arc<Handler>,
    request_timeout: Duration,
) {
    let max_body_bytes = handler.max_body_bytes();
    let request = timeout(request_timeout, read_request(&mut recv, max_body_bytes)).await;
    let response = match request {
        Ok(Ok(req)) => handler.dispatch(req).await,
        Ok(Err(_)) => Response::new(Status::ServerError),
        Err(_) => Response::new(Status::ServerError),
    };

    if let Err(e) = send.write_all(&response.encode()).await {
        error!(error = %e, "writing response failed");
    }
    let _ = send.finish();
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Hot-reload controller (spec §4.G): on SIGHUP, reloads the TLS cert and
/// token table without interrupting in-flight requests. A no-op on
/// non-Unix platforms, per §9's design note — a restart is required there.
#[cfg(unix)]
pub async fn run_reload_listener(handler: Arc<Handler>, tokens_path: Option<std::path::PathBuf>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "could not install SIGHUP handler; hot-reload unavailable");
            return;
        }
    };
    loop {
        sighup.recv().await;
        let Some(path) = tokens_path.as_ref() else {
            info!("reload signal received, but no tokens file is configured");
            continue;
        };
        match TokenTable::load(path) {
            Ok(table) => {
                handler.reload_tokens(table);
                info!("tokens reloaded");
            }
            Err(e) => error!(error = %e, "token reload failed, keeping previous snapshot"),
        }
    }
}

#[cfg(not(unix))]
pub async fn run_reload_listener(_handler: Arc<Handler>, _tokens_path: Option<std::path::PathBuf>) {
    // No SIGHUP equivalent on this platform; reload is unavailable without a restart.
}
