//! REST API endpoints

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::graph::SvgSurface;
use crate::pipeline::PipelineStatus;
use crate::AppState;

use super::sse;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub transport_url: String,
    #[serde(flatten)]
    pub pipeline: PipelineStatus,
}

/// Get current pipeline status
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pipeline = state.get_status().await;
    let transport_url = state.config.read().await.transport.url.clone();

    ApiResponse::success(StatusResponse {
        version: crate::VERSION.to_string(),
        transport_url,
        pipeline,
    })
}

/// Get current configuration, without credentials
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut config = state.config.read().await.clone();
    if config.backend.auth_token.is_some() {
        config.backend.auth_token = Some("***".to_string());
    }
    Json(config)
}

/// Latest rendered probability graph
pub async fn get_graph(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut svg = state.graph_svg.read().await.clone();
    if svg.is_empty() {
        let config = state.config.read().await;
        svg = SvgSurface::new(config.graph.width, config.graph.height).to_svg();
    }

    ([(header::CONTENT_TYPE, "image/svg+xml")], svg)
}

/// SSE stream of inference results
pub async fn probability_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    sse::create_probability_stream(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, HttpConfig};
    use crate::transport::ConnectionState;
    use crate::web::WebServer;
    use crate::ProbabilityUpdate;
    use serde_json::Value;

    async fn serve(state: Arc<AppState>) -> String {
        let app = WebServer::new(state, &HttpConfig::default()).router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let state = AppState::new(Config::default());
        state
            .set_status(PipelineStatus {
                capture_active: true,
                connection: ConnectionState::Open,
                session_id: Some(42),
                buffered_entries: 3,
                latest_probability: Some(0.5),
                ..PipelineStatus::default()
            })
            .await;
        let base = serve(state).await;

        let body: Value = reqwest::get(format!("{}/api/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["connection"], "open");
        assert_eq!(body["data"]["session_id"], 42);
        assert_eq!(body["data"]["buffered_entries"], 3);
        assert_eq!(body["data"]["transport_url"], "ws://localhost:9090/ws");
    }

    #[tokio::test]
    async fn test_graph_endpoint_serves_svg() {
        let state = AppState::new(Config::default());
        let base = serve(Arc::clone(&state)).await;

        let response = reqwest::get(format!("{}/api/graph.svg", base)).await.unwrap();
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "image/svg+xml"
        );
        let svg = response.text().await.unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains(r#"width="600""#));

        state.set_graph_svg("<svg>latest</svg>".to_string()).await;
        let svg = reqwest::get(format!("{}/api/graph.svg", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(svg, "<svg>latest</svg>");
    }

    #[tokio::test]
    async fn test_config_hides_token() {
        let mut config = Config::default();
        config.backend.auth_token = Some("secret".to_string());
        let base = serve(AppState::new(config)).await;

        let body: Value = reqwest::get(format!("{}/api/config", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["backend"]["auth_token"], "***");
    }

    #[tokio::test]
    async fn test_stream_emits_probability_events() {
        let state = AppState::new(Config::default());
        let base = serve(Arc::clone(&state)).await;

        let mut response = reqwest::get(format!("{}/api/stream", base)).await.unwrap();
        state.publish_probability(ProbabilityUpdate {
            probability: 0.42,
            variance: None,
            acceleration: None,
            second: Some(1.5),
        });

        let chunk = response.chunk().await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("event: probability"));
        assert!(text.contains(r#""probability":0.42"#));
    }
}
