//! Kernel message API: a single WebSocket channel carrying typed JSON
//! requests (`{type, id?, ...}`) and responses (`{ok, data?, error?}`).

pub mod channel;

use axum::routing::get;
use axum::Router;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Constant-time token comparison via SHA-256 digest.
pub(crate) fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/v1/channel", get(channel::channel_ws))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the kernel API. Returns the bound address and the
/// server task.
pub async fn serve(
    state: AppState,
    bind: &str,
) -> std::io::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "kernel api exited");
        }
    });
    tracing::info!(addr = %local_addr, "kernel api listening");
    Ok((local_addr, handle))
}
