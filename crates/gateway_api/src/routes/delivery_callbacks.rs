use axum::body::Bytes;
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use domain::Envelope;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};

use crate::gateway::{CallbackAck, CallbackError, CallbackSource};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/delivery/callback", post(handle_status_callback))
        .route("/delivery/rider-location", post(handle_rider_location))
        .route("/delivery/exception", post(handle_exception))
}

fn client_ip(state: &AppState, headers: &HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> Option<IpAddr> {
    if state.trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    peer.map(|ConnectInfo(addr)| addr.ip())
}

/// Platforms always get a `code` envelope back; the HTTP status mirrors it.
fn reply(result: Result<CallbackAck, CallbackError>) -> (StatusCode, Json<Envelope<Value>>) {
    match result {
        Ok(_) => (StatusCode::OK, Json(Envelope::success())),
        Err(e) => {
            let code = e.code();
            let message = match &e {
                CallbackError::Storage(_) => "internal error".to_string(),
                other => other.to_string(),
            };
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(Envelope::error(i64::from(code), message)))
        }
    }
}

fn source(state: &AppState, headers: &HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> CallbackSource {
    CallbackSource {
        ip: client_ip(state, headers, peer),
        received_at: Utc::now(),
    }
}

async fn handle_status_callback(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Envelope<Value>>) {
    let source = source(&state, &headers, peer);
    // Unparseable bodies go through the processor too so they are logged as malformed.
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    reply(state.gateway.handle_callback(&payload, source).await)
}

async fn handle_rider_location(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Envelope<Value>>) {
    let source = source(&state, &headers, peer);
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    reply(state.gateway.handle_rider_location(&payload, source).await)
}

async fn handle_exception(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Envelope<Value>>) {
    let source = source(&state, &headers, peer);
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    reply(state.gateway.handle_exception(&payload, source).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::test_support::*;
    use crate::signing::{self, SignParams};
    use crate::store::OrderStore;
    use axum::body::Body;
    use axum::http::Request;
    use domain::DeliveryStatus;
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app_with_submitted_order(trust_forwarded_for: bool, whitelist: Option<&str>) -> Router {
        let mut p = platform("http://unused");
        p.ip_whitelist = whitelist.map(str::to_string);
        let h = harness(p);
        let mut order = h
            .orders
            .insert_if_absent(new_order("TEST123").into_order(Utc::now()))
            .await
            .unwrap();
        order.status = DeliveryStatus::Submitted;
        order.external_order_no = Some("DL1".into());
        h.orders.save_state(&order).await.unwrap();
        router().with_state(AppState {
            gateway: Arc::new(h.gateway),
            store_backend: "memory",
            trust_forwarded_for,
        })
    }

    fn signed(status: &str) -> String {
        signed_body(json!({"order_no": "DL1", "status": status, "timestamp": Utc::now().timestamp()}))
    }

    fn signed_body(mut payload: Value) -> String {
        let obj = payload.as_object_mut().unwrap();
        let sign = signing::sign(&SignParams::from_json_object(obj), SECRET);
        obj.insert("sign".into(), Value::String(sign));
        payload.to_string()
    }

    async fn post(app: Router, uri: &str, body: String, forwarded: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::post(uri).header("content-type", "application/json");
        if let Some(ip) = forwarded {
            req = req.header("x-forwarded-for", ip);
        }
        let resp = app.oneshot(req.body(Body::from(body)).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn accepted_callback_returns_success_envelope() {
        let app = app_with_submitted_order(false, None).await;
        let (status, body) = post(app.clone(), "/delivery/callback", signed("accepted"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 0);

        // Redelivery is still acknowledged.
        let (status, body) = post(app, "/delivery/callback", signed("accepted"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 0);
    }

    #[tokio::test]
    async fn failures_carry_distinct_codes() {
        let app = app_with_submitted_order(false, None).await;

        let (status, body) = post(app.clone(), "/delivery/callback", "not json".into(), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);

        let mut forged: Value = serde_json::from_str(&signed("accepted")).unwrap();
        forged["status"] = json!("completed");
        let (status, body) = post(app.clone(), "/delivery/callback", forged.to_string(), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], 401);

        let (_, body) = post(app, "/delivery/callback", signed("teleported"), None).await;
        assert_eq!(body["code"], 422);
    }

    #[tokio::test]
    async fn forwarded_address_is_checked_when_trusted() {
        let app = app_with_submitted_order(true, Some("198.51.100.0/24")).await;
        let (_, body) = post(app.clone(), "/delivery/callback", signed("accepted"), Some("203.0.113.9")).await;
        assert_eq!(body["code"], 403);
        let (_, body) = post(app, "/delivery/callback", signed("accepted"), Some("198.51.100.9, 10.0.0.1")).await;
        assert_eq!(body["code"], 0);
    }

    #[tokio::test]
    async fn exception_route_acknowledges_and_rejects_stale() {
        let app = app_with_submitted_order(false, None).await;
        let now = Utc::now().timestamp();
        let body = signed_body(json!({"order_no": "DL1", "exception_type": "address_not_found", "timestamp": now}));
        let (status, body) = post(app.clone(), "/delivery/exception", body, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 0);

        let stale = json!({"order_no": "DL1", "exception_type": "address_not_found", "timestamp": now - 3600});
        let (status, body) = post(app, "/delivery/exception", stale.to_string(), None).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body["code"], 408);
    }
}
