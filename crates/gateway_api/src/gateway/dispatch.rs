use chrono::{DateTime, Utc};
use domain::{DeliveryOrder, DeliveryStatus, NewDeliveryOrder, Party, Platform};
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use super::{Applied, Gateway, Observation};
use crate::delivery_connectors::ConnectorError;
use crate::signing::{Scalar, SignParams, SignedRequest};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("platform unreachable: {0}")]
    Unreachable(String),
    #[error("platform rejected the order ({code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("unreadable platform response: {0}")]
    InvalidResponse(String),
    #[error("order {local_order_no} belongs to platform {order_platform}, not {platform}")]
    PlatformMismatch {
        local_order_no: String,
        order_platform: String,
        platform: String,
    },
    /// The order left `created` without ever being accepted by the platform.
    #[error("order {local_order_no} is {status} and cannot be dispatched")]
    Closed {
        local_order_no: String,
        status: DeliveryStatus,
    },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<ConnectorError> for DispatchError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::Unreachable(m) => DispatchError::Unreachable(m),
            ConnectorError::InvalidResponse(m) => DispatchError::InvalidResponse(m),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub local_order_no: String,
    pub external_order_no: String,
    pub status: DeliveryStatus,
    /// Status label as the platform reported it.
    pub platform_status: Option<String>,
    /// True when the order had already been dispatched and nothing was sent.
    pub replayed: bool,
}

fn party_params(params: SignParams, prefix: &str, party: &Party) -> SignParams {
    params
        .text(&format!("{prefix}_name"), party.name.as_str())
        .text(&format!("{prefix}_address"), party.address.as_str())
        .text(&format!("{prefix}_phone"), party.phone.as_str())
        .opt_float(&format!("{prefix}_lat"), party.lat)
        .opt_float(&format!("{prefix}_lng"), party.lng)
}

/// `goods_info` travels as a JSON string, so it is part of the signature.
fn goods_info(order: &DeliveryOrder) -> String {
    let goods: Vec<_> = order
        .items
        .iter()
        .map(|item| {
            json!({
                "name": item.name,
                "quantity": item.quantity,
                "price": Scalar::Decimal(item.price).to_json(),
            })
        })
        .collect();
    serde_json::Value::Array(goods).to_string()
}

pub(crate) fn receive_order_request(
    order: &DeliveryOrder,
    platform: &Platform,
    callback_url: &str,
    now: DateTime<Utc>,
) -> SignedRequest {
    let params = SignParams::new()
        .text("platform_code", platform.code.as_str())
        .text("external_order_no", order.local_order_no.as_str())
        .int("timestamp", now.timestamp());
    let params = party_params(params, "merchant", &order.merchant);
    let params = party_params(params, "receiver", &order.receiver);
    params
        .text("goods_info", goods_info(order))
        .decimal("goods_amount", order.goods_amount)
        .decimal("delivery_fee", order.delivery_fee)
        .decimal("total_amount", order.total_amount)
        .opt_text("remark", order.remark.as_deref())
        .text("callback_url", callback_url)
        .into_signed(platform.api_secret.expose_secret())
}

impl Gateway {
    /// Submit `order` to `platform`. Safe to retry: once the platform has
    /// assigned an order number, later calls return it without a network call.
    pub async fn dispatch(
        &self,
        order: NewDeliveryOrder,
        platform: &Platform,
    ) -> Result<DispatchOutcome, DispatchError> {
        if order.platform_code != platform.code {
            return Err(DispatchError::PlatformMismatch {
                local_order_no: order.local_order_no,
                order_platform: order.platform_code,
                platform: platform.code.clone(),
            });
        }

        let _guard = self.locks.acquire(&order.local_order_no).await;
        let now = Utc::now();
        let stored = self.orders.insert_if_absent(order.into_order(now)).await?;

        if stored.platform_code != platform.code {
            return Err(DispatchError::PlatformMismatch {
                local_order_no: stored.local_order_no,
                order_platform: stored.platform_code,
                platform: platform.code.clone(),
            });
        }
        if stored.status != DeliveryStatus::Created {
            return match stored.external_order_no {
                Some(external_order_no) => {
                    tracing::info!(
                        local_order_no = %stored.local_order_no,
                        external_order_no = %external_order_no,
                        "order already dispatched; returning stored result"
                    );
                    Ok(DispatchOutcome {
                        local_order_no: stored.local_order_no,
                        external_order_no,
                        status: stored.status,
                        platform_status: stored.platform_status,
                        replayed: true,
                    })
                }
                None => Err(DispatchError::Closed {
                    local_order_no: stored.local_order_no,
                    status: stored.status,
                }),
            };
        }

        let callback_url = platform
            .callback_url
            .clone()
            .unwrap_or_else(|| self.settings.default_callback_url.clone());
        let request = receive_order_request(&stored, platform, &callback_url, now);

        tracing::info!(
            platform = %platform.code,
            local_order_no = %stored.local_order_no,
            "dispatching delivery order"
        );
        let envelope = match self.connector.receive_order(platform, &request).await {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(platform = %platform.code, local_order_no = %stored.local_order_no, "dispatch failed: {}", e);
                return Err(e.into());
            }
        };

        if !envelope.is_success() {
            tracing::warn!(
                platform = %platform.code,
                local_order_no = %stored.local_order_no,
                code = envelope.code,
                "platform rejected order: {}",
                envelope.message
            );
            return Err(DispatchError::Rejected {
                code: envelope.code,
                message: envelope.message,
            });
        }
        let Some(ack) = envelope.data else {
            return Err(DispatchError::InvalidResponse("success without order_no".to_string()));
        };

        let local_order_no = stored.local_order_no.clone();
        let observation = Observation {
            status_text: ack.status_text,
            platform_status: ack.status,
            external_order_no: Some(ack.order_no.clone()),
            ..Observation::status(DeliveryStatus::Submitted)
        };
        let applied = match self.apply_observation(stored, observation, Utc::now()).await {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(
                    local_order_no = %local_order_no,
                    external_order_no = %ack.order_no,
                    "platform accepted order but it could not be recorded: {}",
                    e
                );
                return Err(e.into());
            }
        };
        if let Applied::Unchanged(_) = applied {
            // created -> submitted is always allowed; reaching this means the table changed.
            tracing::warn!(local_order_no = %local_order_no, "submitted transition was refused");
        }

        let order = applied.order();
        Ok(DispatchOutcome {
            local_order_no,
            external_order_no: ack.order_no,
            status: order.status,
            platform_status: order.platform_status.clone(),
            replayed: false,
        })
    }
}
