//! The admin endpoint: liveness, readiness and metrics.
//!
//! Readiness aggregates every cache's bootstrap state and the issuer health
//! flag; the orchestrator stops routing admission and discovery traffic to an
//! instance that reports not-ready.

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

type Check = (String, Box<dyn Fn() -> bool + Send + Sync>);

/// Admin state assembled at startup: a metrics registry and named readiness
/// checks. Read-only once serving.
#[derive(Default)]
pub struct Admin {
    registry: Registry,
    checks: Vec<Check>,
}

// === impl Admin ===

impl Admin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Adds a named readiness check; `/ready` reports 200 only when every
    /// check passes.
    pub fn register_check(
        &mut self,
        name: impl Into<String>,
        check: impl Fn() -> bool + Send + Sync + 'static,
    ) {
        self.checks.push((name.into(), Box::new(check)));
    }

    fn failing(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, check)| !check())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

async fn live() -> &'static str {
    "live\n"
}

async fn ready(Extension(admin): Extension<Arc<Admin>>) -> (StatusCode, String) {
    let failing = admin.failing();
    if failing.is_empty() {
        (StatusCode::OK, "ready\n".to_string())
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("not ready: {}\n", failing.join(", ")),
        )
    }
}

async fn metrics(Extension(admin): Extension<Arc<Admin>>) -> (StatusCode, String) {
    let mut buf = Vec::new();
    match encode(&mut buf, &admin.registry) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8(buf).unwrap_or_default(),
        ),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
    }
}

/// Serves the admin endpoint until the drain fires.
pub async fn serve(addr: SocketAddr, admin: Arc<Admin>, drain: drain::Watch) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .layer(Extension(admin));

    info!(%addr, "admin endpoint listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            drain.signaled().await;
        })
        .await?;
    Ok(())
}
