use axum::{
    Json, Router,
    extract::{Extension, FromRequest, Query, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::{
    job::{LastResult, UpdateJobHandle, UpdateReason},
    mihomo::{LIVENESS_TIMEOUT, MihomoApiError, MihomoClient, builder::GROUP_PROXY},
};


#[derive(Clone)]
pub struct AppState {
    pub job: UpdateJobHandle,
    pub mihomo: MihomoClient,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new("upstream_error", StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<MihomoApiError> for ApiError {
    fn from(value: MihomoApiError) -> Self {
        match &value {
            MihomoApiError::NotFound { name } => {
                ApiError::not_found(value.to_string()).with_detail("name", name.as_str())
            }
            MihomoApiError::Transport { .. } | MihomoApiError::Decode { .. } => {
                ApiError::bad_gateway(value.to_string())
            }
            MihomoApiError::Status { status, .. } => {
                ApiError::bad_gateway(value.to_string()).with_detail("upstream_status", *status)
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/update", post(trigger_update))
        .route("/status", get(update_status))
        .route("/nodes", get(list_nodes))
        .route("/switch", post(switch_node))
        .route("/health", get(health))
        .fallback(fallback_not_found)
        .layer(Extension(state))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn rfc3339(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[derive(Serialize)]
struct TriggerResponse {
    status: &'static str,
    message: String,
    timestamp: String,
    run_id: String,
}

async fn trigger_update(Extension(state): Extension<AppState>) -> Response {
    match state.job.try_start(UpdateReason::Api).await {
        Ok(accepted) => (
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                status: "accepted",
                message: "update started".to_string(),
                timestamp: now_rfc3339(),
                run_id: accepted.run_id,
            }),
        )
            .into_response(),
        Err(busy) => {
            info!(run_id = %busy.run_id, "update request rejected; already running");
            (
                StatusCode::CONFLICT,
                Json(TriggerResponse {
                    status: "busy",
                    message: busy.to_string(),
                    timestamp: now_rfc3339(),
                    run_id: busy.run_id,
                }),
            )
                .into_response()
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    update_running: bool,
    run_id: Option<String>,
    reason: Option<UpdateReason>,
    started_at: Option<String>,
    last_update_time: Option<String>,
    last_update_result: Option<LastResult>,
    update_count: u64,
}

async fn update_status(Extension(state): Extension<AppState>) -> Json<StatusResponse> {
    let snap = state.job.snapshot().await;
    Json(StatusResponse {
        update_running: snap.running,
        run_id: snap.run_id,
        reason: snap.reason,
        started_at: rfc3339(snap.started_at),
        last_update_time: rfc3339(snap.last_update_time),
        last_update_result: snap.last_result,
        update_count: snap.run_count,
    })
}

#[derive(Deserialize)]
struct NodesQuery {
    group: Option<String>,
}

async fn list_nodes(
    Extension(state): Extension<AppState>,
    Query(query): Query<NodesQuery>,
) -> Result<Json<crate::mihomo::GroupView>, ApiError> {
    let group = query.group.unwrap_or_else(|| GROUP_PROXY.to_string());
    let view = state.mihomo.list_group_nodes(&group).await?;
    Ok(Json(view))
}

fn default_group() -> String {
    GROUP_PROXY.to_string()
}

#[derive(Deserialize)]
struct SwitchRequest {
    node: String,
    #[serde(default = "default_group")]
    group: String,
}

async fn switch_node(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<SwitchRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.node.trim().is_empty() {
        return Err(ApiError::invalid_request("node is required"));
    }

    let group = state.mihomo.get_proxy(&req.group).await?;
    let members = group.all.unwrap_or_default();
    if !members.iter().any(|m| m == &req.node) {
        return Err(ApiError::invalid_request(format!(
            "node `{}` is not a member of group `{}`",
            req.node, req.group
        ))
        .with_detail("group", req.group.as_str())
        .with_detail("available", members));
    }

    match state.mihomo.select_proxy(&req.group, &req.node).await {
        Ok(()) => {
            info!(group = %req.group, node = %req.node, "proxy selection changed");
            Ok(Json(json!({
                "status": "ok",
                "message": format!("switched {} to {}", req.group, req.node),
                "node": req.node,
                "group": req.group,
            })))
        }
        Err(err @ MihomoApiError::Transport { .. }) => Err(err.into()),
        Err(err) => {
            warn!(group = %req.group, node = %req.node, error = %err, "proxy selection rejected");
            Err(ApiError::internal(err.to_string()))
        }
    }
}

async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    let (mihomo, version) = match state.mihomo.version_with_timeout(LIVENESS_TIMEOUT).await {
        Ok(v) => ("ok", Some(v.version)),
        Err(_) => ("unreachable", None),
    };
    Json(json!({
        "server": "ok",
        "mihomo": mihomo,
        "mihomo_version": version,
        "timestamp": now_rfc3339(),
    }))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
