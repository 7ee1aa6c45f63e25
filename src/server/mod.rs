// src/server/mod.rs
//! Peer endpoint
//!
//! Serves the remote peer protocol for other autobuild instances:
//! - `GET /v1/status` - this instance's advertisement
//! - `POST /v1/builds` - build one job in a local chroot session
//! - `POST /v1/builds/cancel` - stop a running peer build
//! - `POST /v1/submissions/cancel` - stop a local submission, by key
//!
//! When `[federation] token` is set, every request must carry it in the
//! `x-autobuild-token` header.

mod routes;

pub use routes::create_router;

use crate::daemon::Daemon;
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared state of the peer endpoint
pub struct ServerState {
    pub daemon: Arc<Daemon>,
    /// Required `x-autobuild-token` value, if any
    pub token: Option<String>,
}

impl ServerState {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        let token = daemon.config().federation.token.clone();
        Self { daemon, token }
    }
}

/// Serve the peer endpoint until `shutdown` resolves
pub async fn run_server<F>(daemon: Arc<Daemon>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listen = daemon.config().federation.listen.clone();
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {}", listen))?;

    let state = Arc::new(ServerState::new(daemon));
    if state.token.is_none() {
        tracing::warn!("[server] no federation token set, peer endpoint is open");
    }
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;
    tracing::info!("[server] peer endpoint listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("peer endpoint failed")?;
    tracing::info!("[server] peer endpoint stopped");
    Ok(())
}
