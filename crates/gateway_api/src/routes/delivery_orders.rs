use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use domain::NewDeliveryOrder;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::gateway::{DispatchError, RemoteCallError};
use crate::state::AppState;
use crate::store::RegistryError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/delivery/orders", post(dispatch_order).get(list_orders))
        .route("/delivery/orders/:local_order_no", get(get_order))
        .route("/delivery/status/:external_order_no", get(query_status))
        .route("/delivery/cancel/:external_order_no", post(cancel_order))
        .route("/delivery/platforms", get(list_platforms))
}

fn registry_error(err: RegistryError) -> (StatusCode, String) {
    match err {
        RegistryError::NotFound(code) => (StatusCode::NOT_FOUND, format!("platform {code} not found or inactive")),
        RegistryError::Secret { code, .. } => {
            tracing::error!(platform = %code, "platform secret cannot be decrypted");
            (StatusCode::SERVICE_UNAVAILABLE, format!("platform {code} is misconfigured"))
        }
        RegistryError::Storage(e) => internal(e),
    }
}

fn dispatch_error(err: DispatchError) -> (StatusCode, String) {
    let status = match &err {
        DispatchError::Unreachable(_) | DispatchError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
        DispatchError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchError::PlatformMismatch { .. } => StatusCode::BAD_REQUEST,
        DispatchError::Closed { .. } => StatusCode::CONFLICT,
        DispatchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn remote_error(err: RemoteCallError) -> (StatusCode, String) {
    let status = match &err {
        RemoteCallError::UnknownOrder(_) => StatusCode::NOT_FOUND,
        RemoteCallError::PlatformUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RemoteCallError::Unreachable(_) | RemoteCallError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
        RemoteCallError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RemoteCallError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

async fn dispatch_order(
    State(state): State<AppState>,
    Json(order): Json<NewDeliveryOrder>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if order.local_order_no.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "local_order_no is required".to_string()));
    }
    let platform = state
        .gateway
        .platform(&order.platform_code)
        .await
        .map_err(registry_error)?;
    let outcome = state
        .gateway
        .dispatch(order, &platform)
        .await
        .map_err(dispatch_error)?;
    Ok(Json(json!({ "ok": true, "dispatch": outcome })))
}

async fn get_order(
    State(state): State<AppState>,
    Path(local_order_no): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let order = state
        .gateway
        .order(&local_order_no)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "order not found".to_string()))?;
    Ok(Json(json!({ "ok": true, "order": order })))
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    since: Option<DateTime<Utc>>,
}

async fn list_orders(
    State(state): State<AppState>,
    Query(q): Query<SinceQuery>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let orders = state.gateway.orders_since(q.since).await.map_err(internal)?;
    Ok(Json(json!({ "ok": true, "orders": orders })))
}

async fn query_status(
    State(state): State<AppState>,
    Path(external_order_no): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let remote = state
        .gateway
        .query_status(&external_order_no)
        .await
        .map_err(remote_error)?;
    Ok(Json(json!({ "ok": true, "remote": remote })))
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    reason: Option<String>,
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(external_order_no): Path<String>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let reason = body.and_then(|Json(b)| b.reason).unwrap_or_default();
    let ack = state
        .gateway
        .cancel(&external_order_no, reason.trim())
        .await
        .map_err(remote_error)?;
    Ok(Json(json!({ "ok": true, "cancel": ack })))
}

async fn list_platforms(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, String)> {
    let platforms = state.gateway.list_platforms().await.map_err(registry_error)?;
    Ok(Json(json!({ "ok": true, "platforms": platforms })))
}

fn internal<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    tracing::error!("{}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}
