use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::model::{Link, Rule};
use super::store::LeaseStore;
use crate::cli::config::ApiSettings;
use crate::storage::{Page, StoreError};

/// Path prefix of the job API
pub const API_PREFIX: &str = "/api/v1/dist";

/// Shared state of the job API
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LeaseStore>,
    /// Page size of rule listings
    pub page_size: usize,
    /// Links leased per request when the worker does not ask for a size
    pub batch_size: usize,
}

/// Error response with a JSON `{"error": ...}` body
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    message: String,
}

impl ApiFailure {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiFailure {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StoreError::Backend(_) | StoreError::Serialization(_) => {
                error!("Job API persistence failure: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Create the job API router
pub fn create_router(state: AppState, cors: CorsLayer) -> Router {
    let api = Router::new()
        .route("/rules", get(list_rules).post(upsert_rule))
        .route("/links", get(allocate_links).post(complete_links));

    Router::new()
        .nest(API_PREFIX, api)
        .fallback(not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS layer for the configured origins; no origins allows any
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Bind and serve the job API until Ctrl-C
pub async fn serve(settings: &ApiSettings, state: AppState) -> anyhow::Result<()> {
    let app = create_router(state, cors_layer(&settings.cors_origins));

    let listener = tokio::net::TcpListener::bind(&settings.bind_address).await?;
    info!("Job API listening at http://{}{}", listener.local_addr()?, API_PREFIX);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping the job API"),
        Err(e) => {
            warn!("Cannot listen for Ctrl-C, serving until killed: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "code": "PAGE_NOT_FOUND", "message": "Page not found" })),
    )
}

#[derive(Debug, Deserialize)]
struct RulesQuery {
    isscraper: Option<String>,
    ruleid: Option<String>,
    page: Option<usize>,
}

fn flag(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some("1") | Some("true"))
}

async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<RulesQuery>,
) -> Result<Json<Vec<Rule>>, ApiFailure> {
    if let Some(id) = query.ruleid.as_deref().filter(|id| !id.is_empty()) {
        let rule = state.store.get_rule(id).await?;
        return Ok(Json(vec![rule]));
    }

    if flag(query.isscraper.as_deref()) {
        let rule = state.store.select_rule(None).await?;
        return Ok(Json(rule.into_iter().collect()));
    }

    let page = Page::numbered(query.page.unwrap_or(1), state.page_size);
    Ok(Json(state.store.list_rules(page).await?))
}

async fn upsert_rule(
    State(state): State<AppState>,
    body: Result<Json<Rule>, JsonRejection>,
) -> Result<Json<Rule>, ApiFailure> {
    let Json(rule) = body.map_err(|e| ApiFailure::bad_request(e.body_text()))?;
    Ok(Json(state.store.upsert_rule(rule).await?))
}

#[derive(Debug, Deserialize)]
struct LinksQuery {
    ruleid: Option<String>,
    worker: Option<String>,
    /// Legacy name of `worker`
    scraper: Option<String>,
    size: Option<usize>,
}

async fn allocate_links(
    State(state): State<AppState>,
    Query(query): Query<LinksQuery>,
) -> Result<Json<Vec<Link>>, ApiFailure> {
    let rule_id = query
        .ruleid
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiFailure::bad_request("missing ruleid parameter"))?;
    let worker = query
        .worker
        .or(query.scraper)
        .filter(|worker| !worker.is_empty())
        .ok_or_else(|| ApiFailure::bad_request("missing worker parameter"))?;

    // Unknown rules are a 404 rather than an empty batch
    state.store.get_rule(&rule_id).await?;

    let size = query.size.filter(|size| *size > 0).unwrap_or(state.batch_size);
    let links = state.store.allocate(&rule_id, &worker, size).await?;

    Ok(Json(links))
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    #[serde(default)]
    linkids: Vec<String>,
}

async fn complete_links(
    State(state): State<AppState>,
    body: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let Json(request) = body.map_err(|e| ApiFailure::bad_request(e.body_text()))?;
    state.store.complete(&request.linkids).await?;
    Ok(Json(json!({})))
}
