use axum::{
    extract::{rejection::FormRejection, FromRequestParts, Query, State},
    Form, Json,
};
use std::sync::Arc;
use tracing::debug;

use crate::auth::verify_secret;
use crate::control::ControlPlane;
use crate::error::ApiError;
use crate::models::*;
use crate::AppState;

/// `/ForwardWork` query parameters; a query string that fails to parse is
/// answered with the `{code,msg}` envelope rather than axum's plain text
#[derive(FromRequestParts, serde::Deserialize)]
#[serde(transparent)]
#[from_request(via(Query), rejection(ApiError))]
pub struct ForwardWorkQuery(pub ForwardWorkParams);

/// Start or stop forwarding (query string)
#[utoipa::path(
    get,
    path = "/ForwardWork",
    params(ForwardWorkParams),
    responses(
        (status = 200, description = "Operation applied", body = ApiResponse),
        (status = 400, description = "Malformed request", body = ApiResponse),
        (status = 401, description = "Missing or wrong shared secret", body = ApiResponse),
        (status = 409, description = "Source address could not be bound", body = ApiResponse)
    ),
    tag = "forwarding"
)]
pub async fn forward_work_get(
    State(state): State<Arc<AppState>>,
    ForwardWorkQuery(params): ForwardWorkQuery,
) -> Result<Json<ApiResponse>, ApiError> {
    forward_work(&state, params).await
}

/// Start or stop forwarding (query string and/or urlencoded body)
#[utoipa::path(
    post,
    path = "/ForwardWork",
    params(ForwardWorkParams),
    responses(
        (status = 200, description = "Operation applied", body = ApiResponse),
        (status = 400, description = "Malformed request", body = ApiResponse),
        (status = 401, description = "Missing or wrong shared secret", body = ApiResponse),
        (status = 409, description = "Source address could not be bound", body = ApiResponse)
    ),
    tag = "forwarding"
)]
pub async fn forward_work_post(
    State(state): State<Arc<AppState>>,
    ForwardWorkQuery(query): ForwardWorkQuery,
    form: Result<Form<ForwardWorkParams>, FormRejection>,
) -> Result<Json<ApiResponse>, ApiError> {
    // No urlencoded body is fine: the query string carries everything
    let params = match form {
        Ok(Form(body)) => query.merge(body),
        Err(FormRejection::InvalidFormContentType(_)) => query,
        Err(rejection) => return Err(rejection.into()),
    };
    forward_work(&state, params).await
}

async fn forward_work(
    state: &AppState,
    params: ForwardWorkParams,
) -> Result<Json<ApiResponse>, ApiError> {
    verify_secret(&state.auth_secret, params.auth.as_deref())?;

    let action = ControlPlane::parse_action(&params)?;
    debug!(?action, "ForwardWork");

    match action {
        ForwardAction::Start { from_addr, to_addr } => {
            state.control.request_start(&from_addr, &to_addr).await?;
        }
        ForwardAction::Stop => {
            state.control.request_stop().await;
        }
    }

    Ok(Json(ApiResponse::ok()))
}

/// Live status of the forwarder
#[utoipa::path(
    get,
    path = "/ServerSummary",
    responses(
        (status = 200, description = "Status snapshot", body = ServerSummary)
    ),
    tag = "system"
)]
pub async fn server_summary(State(state): State<Arc<AppState>>) -> Json<ServerSummary> {
    debug!("ServerSummary");
    Json(state.control.request_status(&state.process).await)
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshot = state.control.session().snapshot().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.process.version.clone(),
        forwarding: snapshot.running,
        active_connections: snapshot.connection_count,
    })
}
