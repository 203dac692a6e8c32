//! Read-only HTTP introspection surface.
//!
//! Every endpoint reads a component's exposed stats; nothing here mutates
//! runtime state. The server shuts down with the rest of the process via
//! the shared cancellation token.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::coordination::{AgentRegistry, MessageBus, RegistryFilter};
use crate::health::HealthChecker;
use crate::memory::EpisodicStore;
use crate::metrics::MetricsRegistry;
use crate::shutdown::CancelToken;

/// Shared read-only view over the runtime's components.
pub struct ApiState {
    pub agent_name: String,
    pub metrics: Arc<MetricsRegistry>,
    pub health: Arc<HealthChecker>,
    pub episodes: Arc<EpisodicStore>,
    pub registry: Option<Arc<AgentRegistry>>,
    pub message_bus: Option<Arc<MessageBus>>,
}

/// Build the introspection router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/episodes", get(get_episodes))
        .route("/agents", get(get_agents))
        .route("/messages", get(get_messages))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the token fires.
pub async fn serve(
    addr: std::net::SocketAddr,
    state: Arc<ApiState>,
    cancel: CancelToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "introspection api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let snapshot = state.metrics.snapshot();
    Json(serde_json::json!({
        "agent": state.agent_name,
        "uptime_seconds": snapshot.uptime_seconds,
        "counters": snapshot.counters,
        "gauges": snapshot.gauges,
    }))
}

async fn get_health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let aggregate = state.health.check_all(false).await;
    let status = if aggregate.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(serde_json::json!(aggregate)))
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

#[derive(Debug, Deserialize)]
struct EpisodesQuery {
    #[serde(rename = "type")]
    event_type: Option<String>,
    limit: Option<usize>,
}

async fn get_episodes(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EpisodesQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(20).min(500);
    let result = match &query.event_type {
        Some(event_type) => state.episodes.by_type(event_type, limit).await,
        None => state.episodes.recent(limit).await,
    };
    match result {
        Ok(episodes) => (StatusCode::OK, Json(serde_json::json!({ "episodes": episodes }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn get_agents(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match &state.registry {
        Some(registry) => {
            let agents = registry.list(&RegistryFilter::default()).await;
            (StatusCode::OK, Json(serde_json::json!({ "agents": agents })))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "multi-agent coordination disabled" })),
        ),
    }
}

async fn get_messages(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match &state.message_bus {
        Some(bus) => match bus.stats().await {
            Ok(stats) => (StatusCode::OK, Json(serde_json::json!(stats))),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            ),
        },
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "multi-agent coordination disabled" })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthConfig, MultiAgentConfig};
    use crate::types::Outcome;

    fn state() -> (Arc<ApiState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let episodes = Arc::new(EpisodicStore::open_in_memory(dir.path()).unwrap());
        let state = Arc::new(ApiState {
            agent_name: "Anima".to_string(),
            metrics: MetricsRegistry::shared(),
            health: Arc::new(HealthChecker::new(&HealthConfig::default())),
            episodes,
            registry: None,
            message_bus: Some(Arc::new(
                MessageBus::open_in_memory(&MultiAgentConfig::default()).unwrap(),
            )),
        });
        (state, dir)
    }

    #[tokio::test]
    async fn status_reports_counters() {
        let (state, _dir) = state();
        state.metrics.incr("llm.calls.total", 3);
        let Json(body) = get_status(State(state)).await;
        assert_eq!(body["agent"], "Anima");
        assert_eq!(body["counters"]["llm.calls.total"], 3);
    }

    #[tokio::test]
    async fn episodes_endpoint_filters_by_type() {
        let (state, _dir) = state();
        state
            .episodes
            .add_episode("thought", "pondering", Outcome::Neutral, None)
            .await
            .unwrap();
        state
            .episodes
            .add_episode("user.message", "hi", Outcome::Neutral, None)
            .await
            .unwrap();

        let response = get_episodes(
            State(state),
            Query(EpisodesQuery {
                event_type: Some("thought".to_string()),
                limit: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn agents_endpoint_404s_when_disabled() {
        let (state, _dir) = state();
        let response = get_agents(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn messages_endpoint_reports_stats() {
        let (state, _dir) = state();
        let response = get_messages(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn router_builds() {
        let (state, _dir) = state();
        let _router = router(state);
    }

    #[tokio::test]
    async fn serve_shuts_down_on_cancel() {
        let (state, _dir) = state();
        let source = crate::shutdown::CancelSource::new();
        let token = source.token();
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = tokio::spawn(serve(addr, state, token));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        source.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
