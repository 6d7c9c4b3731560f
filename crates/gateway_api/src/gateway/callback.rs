use chrono::{DateTime, Utc};
use domain::{status_label_of, DeliveryException, DeliveryOrder, DeliveryStatus, Platform, RiderInfo};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use std::net::IpAddr;
use thiserror::Error;

use super::{Applied, Gateway, Observation};
use crate::ip_allow;
use crate::signing::{self, SignParams, SIGN_KEY};
use crate::store::{clip, width, CallbackLogEntry, RegistryError, StoreError};

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("malformed callback: {0}")]
    Malformed(String),
    #[error("callback timestamp is {skew_secs}s away from server time")]
    Stale { skew_secs: i64 },
    #[error("unknown order {0}")]
    UnknownOrder(String),
    #[error("platform {0} is not available")]
    PlatformUnavailable(String),
    #[error("source address not allowed")]
    Forbidden,
    #[error("invalid signature")]
    BadSignature,
    #[error("unknown delivery status {0}")]
    UnknownStatus(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl CallbackError {
    /// Envelope `code` (and HTTP status) reported back to the platform.
    pub fn code(&self) -> u16 {
        match self {
            CallbackError::Malformed(_) => 400,
            CallbackError::BadSignature => 401,
            CallbackError::Forbidden => 403,
            CallbackError::UnknownOrder(_) => 404,
            CallbackError::Stale { .. } => 408,
            CallbackError::UnknownStatus(_) => 422,
            CallbackError::Storage(_) => 500,
            CallbackError::PlatformUnavailable(_) => 503,
        }
    }
}

fn from_registry(code: &str, err: RegistryError) -> CallbackError {
    match err {
        RegistryError::Storage(e) => CallbackError::Storage(StoreError::Database(e)),
        RegistryError::NotFound(_) | RegistryError::Secret { .. } => {
            CallbackError::PlatformUnavailable(code.to_string())
        }
    }
}

/// Where a callback came from, as seen by the HTTP layer.
#[derive(Debug, Clone, Copy)]
pub struct CallbackSource {
    pub ip: Option<IpAddr>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackAck {
    Applied { status: DeliveryStatus },
    /// Redelivered, out of order, or otherwise not a forward move: nothing changed.
    Ignored { status: DeliveryStatus },
}

impl CallbackAck {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            CallbackAck::Applied { status } | CallbackAck::Ignored { status } => *status,
        }
    }
}

fn text(payload: &Map<String, Value>, key: &str) -> Option<String> {
    match payload.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn number(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    match payload.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn timestamp(payload: &Map<String, Value>) -> Option<i64> {
    match payload.get("timestamp") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Rider details arrive either nested (`rider_info: {name, phone}`) or flat.
fn rider(payload: &Map<String, Value>) -> RiderInfo {
    let nested = payload.get("rider_info").and_then(Value::as_object);
    let nested_text = |key: &str| nested.and_then(|n| text(n, key));
    RiderInfo {
        name: nested_text("name").or_else(|| text(payload, "rider_name")),
        phone: nested_text("phone").or_else(|| text(payload, "rider_phone")),
        lat: number(payload, "rider_lat"),
        lng: number(payload, "rider_lng"),
    }
}

/// A callback that passed freshness, lookup, source and signature checks.
struct Verified {
    payload: Map<String, Value>,
    order: DeliveryOrder,
    platform: Platform,
}

impl Gateway {
    /// Validate and apply a status callback. Every outcome, including
    /// rejections, is appended to the callback log.
    pub async fn handle_callback(&self, raw: &Value, source: CallbackSource) -> Result<CallbackAck, CallbackError> {
        let result = self.status_callback(raw, source).await;
        self.log_callback("status", raw, source, &result).await;
        result
    }

    /// Rider position update. Touches coordinates only, never status.
    pub async fn handle_rider_location(
        &self,
        raw: &Value,
        source: CallbackSource,
    ) -> Result<CallbackAck, CallbackError> {
        let result = self.rider_location_callback(raw, source).await;
        self.log_callback("rider_location", raw, source, &result).await;
        result
    }

    /// Delivery exception report (receiver unreachable, address problem and the like).
    /// Recorded on the order; the status stays where it is.
    pub async fn handle_exception(&self, raw: &Value, source: CallbackSource) -> Result<CallbackAck, CallbackError> {
        let result = self.exception_callback(raw, source).await;
        self.log_callback("exception", raw, source, &result).await;
        result
    }

    async fn status_callback(&self, raw: &Value, source: CallbackSource) -> Result<CallbackAck, CallbackError> {
        let Verified {
            payload,
            order,
            platform,
        } = self.verify_callback(raw, source).await?;

        let label = payload
            .get("status")
            .and_then(status_label_of)
            .ok_or_else(|| CallbackError::Malformed("missing status".to_string()))?;
        let Some(status) = DeliveryStatus::from_remote(&label) else {
            tracing::warn!(
                platform = %platform.code,
                local_order_no = %order.local_order_no,
                "unmapped platform status {:?}; order left unchanged",
                label
            );
            return Err(CallbackError::UnknownStatus(label));
        };

        let _guard = self.locks.acquire(&order.local_order_no).await;
        let current = self.reload(&order.local_order_no).await?;
        let observation = Observation {
            status_text: text(&payload, "status_text"),
            platform_status: Some(label),
            rider: Some(rider(&payload)),
            cancel_reason: text(&payload, "cancel_reason"),
            via_callback: true,
            ..Observation::status(status)
        };
        match self.apply_observation(current, observation, source.received_at).await? {
            Applied::Changed(o) => Ok(CallbackAck::Applied { status: o.status }),
            Applied::Unchanged(o) => {
                tracing::info!(
                    local_order_no = %o.local_order_no,
                    current = %o.status,
                    reported = %status,
                    "callback acknowledged without change"
                );
                Ok(CallbackAck::Ignored { status: o.status })
            }
        }
    }

    async fn rider_location_callback(
        &self,
        raw: &Value,
        source: CallbackSource,
    ) -> Result<CallbackAck, CallbackError> {
        let Verified { payload, order, .. } = self.verify_callback(raw, source).await?;
        let update = rider(&payload);
        if update.lat.is_none() || update.lng.is_none() {
            return Err(CallbackError::Malformed("rider_lat and rider_lng are required".to_string()));
        }

        let _guard = self.locks.acquire(&order.local_order_no).await;
        let mut current = self.reload(&order.local_order_no).await?;
        if current.status.is_terminal() {
            return Ok(CallbackAck::Ignored { status: current.status });
        }
        current.rider = Some(current.rider.take().unwrap_or_default().merged(&update));
        current.last_callback_at = Some(source.received_at);
        current.updated_at = source.received_at;
        self.persist(&mut current).await?;
        tracing::debug!(local_order_no = %current.local_order_no, "rider location updated");
        Ok(CallbackAck::Applied { status: current.status })
    }

    async fn exception_callback(&self, raw: &Value, source: CallbackSource) -> Result<CallbackAck, CallbackError> {
        let Verified {
            payload,
            order,
            platform,
        } = self.verify_callback(raw, source).await?;
        let exception_type = text(&payload, "exception_type")
            .ok_or_else(|| CallbackError::Malformed("missing exception_type".to_string()))?;

        let _guard = self.locks.acquire(&order.local_order_no).await;
        let mut current = self.reload(&order.local_order_no).await?;
        tracing::warn!(
            platform = %platform.code,
            local_order_no = %current.local_order_no,
            exception_type = %exception_type,
            "delivery exception reported"
        );
        current.exception = Some(DeliveryException {
            exception_type,
            description: text(&payload, "exception_desc"),
            reported_at: source.received_at,
        });
        current.last_callback_at = Some(source.received_at);
        current.updated_at = source.received_at;
        self.persist(&mut current).await?;
        Ok(CallbackAck::Applied { status: current.status })
    }

    /// Required fields, freshness, order lookup, platform lookup, source address, signature; in that order.
    async fn verify_callback(&self, raw: &Value, source: CallbackSource) -> Result<Verified, CallbackError> {
        let payload = raw
            .as_object()
            .ok_or_else(|| CallbackError::Malformed("body must be a JSON object".to_string()))?;
        let order_no = text(payload, "order_no").ok_or_else(|| CallbackError::Malformed("missing order_no".to_string()))?;
        let ts = timestamp(payload).ok_or_else(|| CallbackError::Malformed("missing timestamp".to_string()))?;

        // Saturates at the i64 ends, which is far outside any window.
        let skew_secs = source.received_at.timestamp().saturating_sub(ts);
        if skew_secs.unsigned_abs() > self.settings.callback_tolerance.num_seconds().unsigned_abs() {
            tracing::warn!(order_no = %order_no, skew_secs, "stale callback rejected");
            return Err(CallbackError::Stale { skew_secs });
        }

        let order = self
            .orders
            .find_by_external_no(&order_no)
            .await?
            .ok_or_else(|| CallbackError::UnknownOrder(order_no.clone()))?;
        if let Some(local) = text(payload, "external_order_no") {
            if local != order.local_order_no {
                tracing::warn!(order_no = %order_no, "callback names a different local order {}", local);
                return Err(CallbackError::UnknownOrder(order_no));
            }
        }

        let platform = self
            .platforms
            .lookup(&order.platform_code)
            .await
            .map_err(|e| from_registry(&order.platform_code, e))?;

        if !ip_allow::is_allowed(source.ip, platform.ip_whitelist.as_deref()) {
            tracing::warn!(platform = %platform.code, source = ?source.ip, "callback from address outside allow-list");
            return Err(CallbackError::Forbidden);
        }

        let sign = payload.get(SIGN_KEY).and_then(Value::as_str).unwrap_or_default();
        let params = SignParams::from_json_object(payload);
        if sign.is_empty() || !signing::verify(&params, sign, platform.api_secret.expose_secret()) {
            tracing::warn!(platform = %platform.code, order_no = %order_no, "callback signature mismatch");
            return Err(CallbackError::BadSignature);
        }

        Ok(Verified {
            payload: payload.clone(),
            order,
            platform,
        })
    }

    async fn log_callback(
        &self,
        kind: &'static str,
        raw: &Value,
        source: CallbackSource,
        result: &Result<CallbackAck, CallbackError>,
    ) {
        let (result_code, message) = match result {
            Ok(ack) => (0, format!("ok ({})", ack.status())),
            Err(e) => (i32::from(e.code()), e.to_string()),
        };
        let external_order_no = raw
            .get("order_no")
            .and_then(status_label_of)
            .map(|no| clip(no, width::ORDER_NO));
        let platform_code = match external_order_no.as_deref() {
            Some(no) => self
                .orders
                .find_by_external_no(no)
                .await
                .ok()
                .flatten()
                .map(|o| o.platform_code),
            None => None,
        };
        let entry = CallbackLogEntry {
            kind,
            external_order_no,
            platform_code,
            source_ip: source.ip.map(|ip| ip.to_string()),
            result_code,
            message: Some(clip(message, width::LOG_MESSAGE)),
            payload: raw.clone(),
        };
        if let Err(e) = self.orders.append_callback_log(entry).await {
            tracing::error!("failed to write callback log: {}", e);
        }
    }
}
