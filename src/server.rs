//! HTTP tool server.
//!
//! Exposes the query layer as JSON tool endpoints for agents and editors.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/tools/list` | List the tools with their parameters |
//! | `POST` | `/tools/search_docs` | Semantic search over documentation |
//! | `POST` | `/tools/search_code` | Semantic search over code, optionally per repo |
//! | `POST` | `/tools/get_chunks` | Every chunk of one document, in order |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Response Contract
//!
//! Tool calls always answer `200 OK`, including for malformed bodies and
//! missing parameters, with both a rendered text and structured data:
//!
//! ```json
//! { "text": "## Result 1\nURL: ...", "result": { "kind": "results", "data": [ ... ] } }
//! { "text": "Missing index identifier: ...", "result": { "kind": "message", "data": "..." } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::query::{GetChunksRequest, QueryResponse, QueryService, SearchRequest};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    query: Arc<QueryService>,
}

/// Starts the tool server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let query = QueryService::new(config)?;
    let app = router(Arc::new(query));

    let bind_addr = config.server.bind.clone();
    println!("Tool server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "serving");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Routes over a prepared [`QueryService`].
pub fn router(query: Arc<QueryService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/search_docs", post(handle_search_docs))
        .route("/tools/search_code", post(handle_search_code))
        .route("/tools/get_chunks", post(handle_get_chunks))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { query })
}

/// Body of every tool response.
#[derive(Serialize)]
struct ToolOutput {
    text: String,
    result: QueryResponse,
}

impl From<QueryResponse> for ToolOutput {
    fn from(result: QueryResponse) -> Self {
        Self {
            text: result.render(),
            result,
        }
    }
}

/// Decode a tool body, turning any failure into a diagnostic response.
fn parse_params<T: DeserializeOwned>(
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<T, Json<ToolOutput>> {
    let diagnostic = |msg: String| Json(ToolOutput::from(QueryResponse::Message(msg)));
    let Json(value) = body.map_err(|e| diagnostic(format!("Invalid request body: {}", e.body_text())))?;
    serde_json::from_value(value).map_err(|e| diagnostic(format!("Invalid parameters: {}", e)))
}

async fn handle_search_docs(
    State(state): State<AppState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Json<ToolOutput> {
    let req: SearchRequest = match parse_params(body) {
        Ok(req) => req,
        Err(diagnostic) => return diagnostic,
    };
    Json(state.query.search_docs(&req).await.into())
}

async fn handle_search_code(
    State(state): State<AppState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Json<ToolOutput> {
    let req: SearchRequest = match parse_params(body) {
        Ok(req) => req,
        Err(diagnostic) => return diagnostic,
    };
    Json(state.query.search_code(&req).await.into())
}

async fn handle_get_chunks(
    State(state): State<AppState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Json<ToolOutput> {
    let req: GetChunksRequest = match parse_params(body) {
        Ok(req) => req,
        Err(diagnostic) => return diagnostic,
    };
    Json(state.query.get_chunks(&req).await.into())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolInfo {
    name: &'static str,
    description: &'static str,
    parameters: serde_json::Value,
}

fn target_properties() -> serde_json::Map<String, serde_json::Value> {
    let mut props = serde_json::Map::new();
    props.insert("product_name".into(), serde_json::json!({ "type": "string" }));
    props.insert("version".into(), serde_json::json!({ "type": "string" }));
    props.insert(
        "collection".into(),
        serde_json::json!({ "type": "string", "description": "explicit index name" }),
    );
    props
}

fn search_schema(with_repo: bool) -> serde_json::Value {
    let mut props = target_properties();
    props.insert("query".into(), serde_json::json!({ "type": "string" }));
    props.insert("url_prefix".into(), serde_json::json!({ "type": "string" }));
    props.insert("limit".into(), serde_json::json!({ "type": "integer", "minimum": 1 }));
    if with_repo {
        props.insert("repo".into(), serde_json::json!({ "type": "string" }));
    }
    serde_json::json!({ "type": "object", "properties": props, "required": ["query"] })
}

async fn handle_list_tools() -> Json<serde_json::Value> {
    let mut get_props = target_properties();
    get_props.insert("url".into(), serde_json::json!({ "type": "string" }));

    let tools = vec![
        ToolInfo {
            name: "search_docs",
            description: "Semantic search over indexed documentation",
            parameters: search_schema(false),
        },
        ToolInfo {
            name: "search_code",
            description: "Semantic search over indexed source code",
            parameters: search_schema(true),
        },
        ToolInfo {
            name: "get_chunks",
            description: "Fetch every chunk of one document in reading order",
            parameters: serde_json::json!({
                "type": "object",
                "properties": get_props,
                "required": ["url"],
            }),
        },
    ];
    Json(serde_json::json!({ "tools": tools }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_parameters_become_diagnostic() {
        let body = Ok(Json(serde_json::json!({ "product_name": "acme" })));
        let out = parse_params::<SearchRequest>(body).err().unwrap();
        assert!(out.0.text.starts_with("Invalid parameters"));
        assert!(matches!(out.0.result, QueryResponse::Message(_)));
    }

    #[test]
    fn test_missing_target_is_a_message_not_an_error() {
        let body = Ok(Json(serde_json::json!({ "query": "install" })));
        let req: SearchRequest = parse_params(body).ok().unwrap();
        assert_eq!(req.target.collection(), None);
    }

    #[tokio::test]
    async fn test_list_tools() {
        let Json(value) = handle_list_tools().await;
        let names: Vec<&str> = value["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["search_docs", "search_code", "get_chunks"]);
        assert!(value["tools"][1]["parameters"]["properties"]["repo"].is_object());
    }

    #[tokio::test]
    async fn test_health_reports_version() {
        let Json(health) = handle_health().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    }
}
