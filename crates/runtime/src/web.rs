//! HTTP surface: webhook-triggered skills and a small status index.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, error};

use courier_core::{Event, Matcher};
use courier_skills::SkillRegistry;

use crate::metrics::Metrics;
use crate::runner::SkillRunner;

#[derive(Clone)]
pub struct WebState {
    pub registry: Arc<RwLock<SkillRegistry>>,
    pub runner: Arc<SkillRunner>,
    pub metrics: Arc<Metrics>,
    pub token: Option<String>,
    pub default_connector: String,
    pub hide_index: bool,
}

/// Constant-time comparison for bearer tokens.
fn secure_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

async fn require_token(State(state): State<WebState>, request: Request, next: Next) -> Response {
    let token = match &state.token {
        Some(token) => token,
        None => return next.run(request).await,
    };
    let authorized = match request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(h) if h.starts_with("Bearer ") => secure_eq(&h[7..], token),
        _ => false,
    };
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response();
    }
    next.run(request).await
}

async fn index(State(state): State<WebState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "courier",
        "version": env!("CARGO_PKG_VERSION"),
        "metrics": state.metrics.snapshot(),
    }))
}

async fn call_webhook(
    State(state): State<WebState>,
    Path((skill_name, webhook)): Path<(String, String)>,
    body: String,
) -> Response {
    let target = {
        let registry = state.registry.read().await;
        registry.by_name(&skill_name)
    };
    let target = match target {
        Some(skill)
            if skill
                .matchers
                .iter()
                .any(|m| matches!(m, Matcher::Webhook { name } if name == &webhook)) =>
        {
            skill
        }
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": format!("no webhook {} on skill {}", webhook, skill_name)
                })),
            )
                .into_response();
        }
    };

    let payload = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
    let event = Event::webhook(&state.default_connector, &webhook, payload)
        .with_raw(serde_json::Value::String(body));
    debug!(skill = %target.name, webhook = %webhook, "Webhook fired");
    state.metrics.record_webhook();
    state.runner.spawn(target, event);
    (StatusCode::OK, Json(json!({"called_skill": webhook}))).into_response()
}

/// Webhook routes answer with and without a trailing slash; the token
/// guard covers them but never the index.
pub fn router(state: WebState) -> Router {
    let mut router = Router::new()
        .route("/skill/:skill/:webhook", post(call_webhook))
        .route("/skill/:skill/:webhook/", post(call_webhook))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));
    if !state.hide_index {
        router = router.route("/", get(index));
    }
    router
        .layer(CorsLayer::permissive().allow_credentials(false))
        .with_state(state)
}

pub fn spawn_server(
    listener: TcpListener,
    state: WebState,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let app = router(state);
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown = shutdown;
                let _ = shutdown.recv().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "Web server exited with error");
        }
    })
}
