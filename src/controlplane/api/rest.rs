//! REST API Handlers
//!
//! Implements the endpoints for domain reports, quota edits, capacity
//! edits and discovery. The target cluster is taken from the
//! `X-Cluster-Id` header and defaults to the engine's default cluster.

use super::auth::Authorizer;
use crate::controlplane::engine::{ClusterRuntime, Engine};
use crate::domain::ports::{RequestContext, Token};
use crate::edits::{CapacityRequest, DomainQuotaOptions, QuotaRequest};
use crate::error::Error;
use axum::{
    extract::{ConnectInfo, Json, Path, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const HEADER_CLUSTER_ID: &str = "x-cluster-id";
pub const RULE_DISCOVER: &str = "domain:discover";
pub const RULE_SHOW: &str = "domain:show";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Quota update request for a domain or project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaUpdateBody {
    /// service type → resource name → requested quota
    #[serde(default)]
    pub services: QuotaRequest,
    /// Domain edits only: skip the project quota check on lowering
    #[serde(default)]
    pub bypass_project_check: bool,
}

/// Project update response; lists backend pushes that did not go through
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectUpdateResponse {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub backend_errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub new_domains: Vec<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

/// Engine error rendered for API callers
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match status.as_u16() {
            400 => ApiErrorResponse {
                error: "bad_request".into(),
                message: self.0.to_string(),
                details: None,
            },
            401 => ApiErrorResponse {
                error: "unauthenticated".into(),
                message: self.0.to_string(),
                details: None,
            },
            403 => ApiErrorResponse {
                error: "forbidden".into(),
                message: self.0.to_string(),
                details: None,
            },
            404 => ApiErrorResponse {
                error: "not_found".into(),
                message: self.0.to_string(),
                details: None,
            },
            422 => ApiErrorResponse {
                error: "validation_failed".into(),
                message: self.0.to_string(),
                details: Some(self.0.messages()),
            },
            _ => {
                error!("Request failed: {}", self.0);
                ApiErrorResponse {
                    error: "internal_error".into(),
                    message: "internal server error".into(),
                    details: None,
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    engine: Arc<Engine>,
    authorizer: Arc<dyn Authorizer>,
}

impl RestRouter {
    pub fn new(engine: Arc<Engine>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { engine, authorizer }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            engine: self.engine,
            authorizer: self.authorizer,
        };

        Router::new()
            // Domain endpoints
            .route("/v1/domains/discover", post(discover_domains))
            .route("/v1/domains/:id", get(get_domain).put(put_domain))
            // Project endpoints
            .route("/v1/domains/:id/projects/:pid", put(put_project))
            // Cluster endpoints
            .route("/v1/clusters/:id", put(put_cluster))
            // Health endpoint
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    authorizer: Arc<dyn Authorizer>,
}

/// Authenticated caller of one request
struct Caller {
    token: Token,
    context: RequestContext,
    cluster_id: Option<String>,
}

impl AppState {
    fn caller(
        &self,
        headers: &HeaderMap,
        uri: &Uri,
        connect: Option<ConnectInfo<SocketAddr>>,
    ) -> ApiResult<Caller> {
        let token = self.authorizer.authorize(headers)?;

        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string());
        let remote_addr = forwarded
            .or_else(|| connect.map(|ConnectInfo(addr)| addr.to_string()))
            .unwrap_or_default();

        let context = RequestContext {
            remote_addr,
            user_agent: headers
                .get(axum::http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            request_path: uri.path().to_string(),
        };

        let cluster_id = headers
            .get(HEADER_CLUSTER_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(Caller {
            token,
            context,
            cluster_id,
        })
    }

    fn cluster(&self, caller: &Caller) -> ApiResult<&ClusterRuntime> {
        let cluster_id = caller
            .cluster_id
            .as_deref()
            .unwrap_or(self.engine.default_cluster());
        Ok(self.engine.cluster(cluster_id)?)
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Get the report of one domain
async fn get_domain(
    State(state): State<AppState>,
    Path(domain_id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<Response> {
    let caller = state.caller(&headers, &uri, connect)?;
    if !caller.token.check(RULE_SHOW) {
        return Err(Error::Forbidden {
            rule: RULE_SHOW.to_string(),
        }
        .into());
    }
    let cluster = state.cluster(&caller)?;
    let report = state.engine.domain_report(cluster.id(), &domain_id).await?;
    Ok((StatusCode::OK, Json(report)).into_response())
}

/// Set domain quotas
async fn put_domain(
    State(state): State<AppState>,
    Path(domain_id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Json(body): Json<QuotaUpdateBody>,
) -> ApiResult<Response> {
    let caller = state.caller(&headers, &uri, connect)?;
    let cluster = state.cluster(&caller)?;
    info!("Updating quotas of domain {} in cluster {}", domain_id, cluster.id());

    let options = DomainQuotaOptions {
        bypass_project_check: body.bypass_project_check,
    };
    let report = cluster
        .editor
        .set_domain_quotas(&domain_id, &body.services, options, &caller.token, &caller.context)
        .await?;
    Ok((StatusCode::OK, Json(report)).into_response())
}

/// Set project quotas
async fn put_project(
    State(state): State<AppState>,
    Path((domain_id, project_id)): Path<(String, String)>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Json(body): Json<QuotaUpdateBody>,
) -> ApiResult<Response> {
    let caller = state.caller(&headers, &uri, connect)?;
    let cluster = state.cluster(&caller)?;
    info!(
        "Updating quotas of project {} in domain {} in cluster {}",
        project_id,
        domain_id,
        cluster.id()
    );

    let outcome = cluster
        .editor
        .set_project_quotas(&domain_id, &project_id, &body.services, &caller.token, &caller.context)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ProjectUpdateResponse {
            backend_errors: outcome.backend_errors,
        }),
    )
        .into_response())
}

/// Set manually maintained cluster capacity
async fn put_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Json(body): Json<CapacityRequest>,
) -> ApiResult<Response> {
    let caller = state.caller(&headers, &uri, connect)?;
    let cluster = state
        .engine
        .resolve_cluster(&cluster_id, caller.cluster_id.as_deref())?;
    info!("Updating capacity of cluster {}", cluster.id());

    cluster
        .editor
        .set_cluster_capacity(&body, &caller.token, &caller.context)
        .await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Register domains and projects not yet known
async fn discover_domains(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<Response> {
    let caller = state.caller(&headers, &uri, connect)?;
    if !caller.token.check(RULE_DISCOVER) {
        return Err(Error::Forbidden {
            rule: RULE_DISCOVER.to_string(),
        }
        .into());
    }
    let cluster = state.cluster(&caller)?;

    let summary = state.engine.discover(cluster.id()).await?;
    if summary.new_domains.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(DiscoveryResponse {
            new_domains: summary.new_domains,
        }),
    )
        .into_response())
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
