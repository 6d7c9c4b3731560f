use async_trait::async_trait;
use domain::{Envelope, Platform, ReceiveOrderAck, RemoteStatus};
use serde_json::Value;
use thiserror::Error;

use crate::signing::SignedRequest;

pub mod signed_rest;

pub use signed_rest::SignedRestConnector;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Transport failure, timeout, or a 5xx without a readable envelope.
    #[error("platform unreachable: {0}")]
    Unreachable(String),
    #[error("unreadable platform response: {0}")]
    InvalidResponse(String),
}

/// Outbound calls to a delivery platform. Requests arrive already signed.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    async fn receive_order(
        &self,
        platform: &Platform,
        request: &SignedRequest,
    ) -> Result<Envelope<ReceiveOrderAck>, ConnectorError>;

    async fn query_status(
        &self,
        platform: &Platform,
        request: &SignedRequest,
    ) -> Result<Envelope<RemoteStatus>, ConnectorError>;

    async fn cancel_order(
        &self,
        platform: &Platform,
        request: &SignedRequest,
    ) -> Result<Envelope<Value>, ConnectorError>;
}
