use chrono::Utc;
use domain::{DeliveryOrder, DeliveryStatus, Platform, RemoteStatus};
use secrecy::ExposeSecret;
use serde::Serialize;
use thiserror::Error;

use super::{Gateway, Observation};
use crate::delivery_connectors::ConnectorError;
use crate::signing::{SignParams, SignedRequest};
use crate::store::{RegistryError, StoreError};

#[derive(Debug, Error)]
pub enum RemoteCallError {
    #[error("unknown order {0}")]
    UnknownOrder(String),
    #[error("platform {0} is not available")]
    PlatformUnavailable(String),
    #[error("platform unreachable: {0}")]
    Unreachable(String),
    #[error("platform refused ({code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("unreadable platform response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

pub type QueryError = RemoteCallError;
pub type CancelError = RemoteCallError;

impl From<ConnectorError> for RemoteCallError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::Unreachable(m) => RemoteCallError::Unreachable(m),
            ConnectorError::InvalidResponse(m) => RemoteCallError::InvalidResponse(m),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelAck {
    pub external_order_no: String,
    pub status: DeliveryStatus,
}

fn request(platform: &Platform, external_order_no: &str) -> SignParams {
    SignParams::new()
        .text("platform_code", platform.code.as_str())
        .text("order_no", external_order_no)
        .int("timestamp", Utc::now().timestamp())
}

impl Gateway {
    async fn resolve(&self, external_order_no: &str) -> Result<(DeliveryOrder, Platform), RemoteCallError> {
        let order = self
            .orders
            .find_by_external_no(external_order_no)
            .await?
            .ok_or_else(|| RemoteCallError::UnknownOrder(external_order_no.to_string()))?;
        let platform = self.platforms.lookup(&order.platform_code).await.map_err(|e| match e {
            RegistryError::Storage(e) => RemoteCallError::Storage(StoreError::Database(e)),
            RegistryError::NotFound(code) => RemoteCallError::PlatformUnavailable(code),
            RegistryError::Secret { code, .. } => RemoteCallError::PlatformUnavailable(code),
        })?;
        Ok((order, platform))
    }

    /// Ask the platform for the current status and fold any forward move into
    /// local state. Safe to call repeatedly.
    pub async fn query_status(&self, external_order_no: &str) -> Result<RemoteStatus, QueryError> {
        let (order, platform) = self.resolve(external_order_no).await?;
        let signed: SignedRequest = request(&platform, external_order_no).into_signed(platform.api_secret.expose_secret());

        let envelope = self.connector.query_status(&platform, &signed).await.map_err(|e| {
            tracing::warn!(platform = %platform.code, external_order_no, "status query failed: {}", e);
            RemoteCallError::from(e)
        })?;
        if !envelope.is_success() {
            tracing::warn!(platform = %platform.code, external_order_no, code = envelope.code, "status query refused: {}", envelope.message);
            return Err(RemoteCallError::Rejected {
                code: envelope.code,
                message: envelope.message,
            });
        }
        let remote = envelope
            .data
            .ok_or_else(|| RemoteCallError::InvalidResponse("success without data".to_string()))?;

        match DeliveryStatus::from_remote(&remote.status) {
            Some(status) => {
                let _guard = self.locks.acquire(&order.local_order_no).await;
                let current = self.reload(&order.local_order_no).await?;
                let observation = Observation {
                    status_text: remote.status_text.clone(),
                    platform_status: Some(remote.status.clone()),
                    rider: Some(remote.rider()),
                    ..Observation::status(status)
                };
                self.apply_observation(current, observation, Utc::now()).await?;
            }
            None => tracing::warn!(
                platform = %platform.code,
                external_order_no,
                "status query returned unmapped status {:?}",
                remote.status
            ),
        }
        Ok(remote)
    }

    /// Cancel at the platform, then record the cancellation locally. An order
    /// already in a final status is answered with that status and nothing is sent.
    pub async fn cancel(&self, external_order_no: &str, reason: &str) -> Result<CancelAck, CancelError> {
        let (order, platform) = self.resolve(external_order_no).await?;
        if order.status.is_terminal() {
            return Ok(CancelAck {
                external_order_no: external_order_no.to_string(),
                status: order.status,
            });
        }
        let signed = request(&platform, external_order_no)
            .text("cancel_reason", reason)
            .into_signed(platform.api_secret.expose_secret());

        tracing::info!(platform = %platform.code, external_order_no, "cancelling delivery order");
        let envelope = self.connector.cancel_order(&platform, &signed).await.map_err(|e| {
            tracing::warn!(platform = %platform.code, external_order_no, "cancel failed: {}", e);
            RemoteCallError::from(e)
        })?;
        if !envelope.is_success() {
            tracing::warn!(platform = %platform.code, external_order_no, code = envelope.code, "cancel refused: {}", envelope.message);
            return Err(RemoteCallError::Rejected {
                code: envelope.code,
                message: envelope.message,
            });
        }

        let _guard = self.locks.acquire(&order.local_order_no).await;
        let current = self.reload(&order.local_order_no).await?;
        let observation = Observation {
            cancel_reason: Some(reason.to_string()).filter(|r| !r.is_empty()),
            ..Observation::status(DeliveryStatus::Cancelled)
        };
        let applied = self.apply_observation(current, observation, Utc::now()).await?;
        Ok(CancelAck {
            external_order_no: external_order_no.to_string(),
            status: applied.order().status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::store::OrderStore;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn submitted(h: &Harness) {
        let mut order = h
            .orders
            .insert_if_absent(new_order("TEST123").into_order(Utc::now()))
            .await
            .unwrap();
        order.status = DeliveryStatus::Submitted;
        order.external_order_no = Some("DL1".into());
        h.orders.save_state(&order).await.unwrap();
    }

    #[tokio::test]
    async fn query_applies_forward_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/order/status"))
            .and(query_param("platform_code", "banxia"))
            .and(query_param("order_no", "DL1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"order_no": "DL1", "status": 2, "status_text": "picked up",
                         "rider_name": "Zhang", "rider_lat": 31.23, "rider_lng": 121.47}
            })))
            .expect(2)
            .mount(&server)
            .await;
        let h = harness(platform(&server.uri()));
        submitted(&h).await;
        let mut events = h.gateway.subscribe();

        let remote = h.gateway.query_status("DL1").await.unwrap();
        assert_eq!(remote.status, "2");
        let order = h.orders.find_by_local_no("TEST123").await.unwrap().unwrap();
        assert_eq!(order.status, DeliveryStatus::PickedUp);
        assert_eq!(order.rider.unwrap().name.as_deref(), Some("Zhang"));
        assert!(order.last_callback_at.is_none());
        assert_eq!(events.try_recv().unwrap().to, DeliveryStatus::PickedUp);

        // Same answer again: no transition, no event.
        h.gateway.query_status("DL1").await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn query_with_unmapped_status_changes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/order/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "data": {"order_no": "DL1", "status": "weird"}
            })))
            .mount(&server)
            .await;
        let h = harness(platform(&server.uri()));
        submitted(&h).await;

        let remote = h.gateway.query_status("DL1").await.unwrap();
        assert_eq!(remote.status, "weird");
        let order = h.orders.find_by_local_no("TEST123").await.unwrap().unwrap();
        assert_eq!(order.status, DeliveryStatus::Submitted);
    }

    #[tokio::test]
    async fn query_unknown_order() {
        let h = harness(platform("http://unused"));
        let err = h.gateway.query_status("DL999").await.unwrap_err();
        assert!(matches!(err, RemoteCallError::UnknownOrder(_)));
    }

    #[tokio::test]
    async fn cancel_records_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order/cancel"))
            .and(body_partial_json(json!({"order_no": "DL1", "cancel_reason": "customer changed mind"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "message": "success"})))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(platform(&server.uri()));
        submitted(&h).await;

        let ack = h.gateway.cancel("DL1", "customer changed mind").await.unwrap();
        assert_eq!(ack.status, DeliveryStatus::Cancelled);
        let order = h.orders.find_by_local_no("TEST123").await.unwrap().unwrap();
        assert_eq!(order.status, DeliveryStatus::Cancelled);
        assert_eq!(order.cancel_reason.as_deref(), Some("customer changed mind"));

        // Already cancelled: no second call.
        let again = h.gateway.cancel("DL1", "customer changed mind").await.unwrap();
        assert_eq!(again.status, DeliveryStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_refused_keeps_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 2001, "message": "rider already picked up"})))
            .mount(&server)
            .await;
        let h = harness(platform(&server.uri()));
        submitted(&h).await;

        let err = h.gateway.cancel("DL1", "too slow").await.unwrap_err();
        assert!(matches!(err, RemoteCallError::Rejected { code: 2001, .. }));
        let order = h.orders.find_by_local_no("TEST123").await.unwrap().unwrap();
        assert_eq!(order.status, DeliveryStatus::Submitted);
    }

    #[tokio::test]
    async fn cancel_after_completion_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "message": "success"})))
            .expect(0)
            .mount(&server)
            .await;
        let h = harness(platform(&server.uri()));
        submitted(&h).await;
        let mut order = h.orders.find_by_local_no("TEST123").await.unwrap().unwrap();
        order.status = DeliveryStatus::Completed;
        h.orders.save_state(&order).await.unwrap();

        let ack = h.gateway.cancel("DL1", "too late").await.unwrap();
        assert_eq!(ack.status, DeliveryStatus::Completed);
        let order = h.orders.find_by_local_no("TEST123").await.unwrap().unwrap();
        assert_eq!(order.status, DeliveryStatus::Completed);
        assert!(order.cancel_reason.is_none());
    }
}
