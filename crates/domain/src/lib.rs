mod status;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub use status::{DeliveryStatus, UnknownStatus};

/// A third-party delivery platform and the credentials used to talk to it.
/// The secret stays in memory; its `Debug` output is redacted.
#[derive(Debug, Clone)]
pub struct Platform {
    pub code: String,
    pub display_name: String,
    pub api_key: String,
    pub api_secret: SecretString,
    pub base_url: String,
    /// Callback URL handed to the platform; falls back to the gateway default when unset.
    pub callback_url: Option<String>,
    /// Comma separated IPv4 addresses, `*` wildcards or CIDR blocks. Empty allows all.
    pub ip_whitelist: Option<String>,
    pub active: bool,
}

/// Platform as exposed over the API (no credentials).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSummary {
    pub code: String,
    pub display_name: String,
    pub base_url: String,
    pub active: bool,
}

impl From<&Platform> for PlatformSummary {
    fn from(p: &Platform) -> Self {
        PlatformSummary {
            code: p.code.clone(),
            display_name: p.display_name.clone(),
            base_url: p.base_url.clone(),
            active: p.active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    pub address: String,
    pub phone: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryItem {
    pub name: String,
    pub quantity: i32,
    pub price: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiderInfo {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl RiderInfo {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.phone.is_none() && self.lat.is_none() && self.lng.is_none()
    }

    /// Overlay the fields present in `update`, keeping what we already knew otherwise.
    pub fn merged(&self, update: &RiderInfo) -> RiderInfo {
        RiderInfo {
            name: update.name.clone().or_else(|| self.name.clone()),
            phone: update.phone.clone().or_else(|| self.phone.clone()),
            lat: update.lat.or(self.lat),
            lng: update.lng.or(self.lng),
        }
    }
}

/// A delivery order as owned by the gateway once dispatched.
///
/// `local_order_no` guards against duplicate submissions and `external_order_no`
/// (assigned by the platform) against duplicate callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOrder {
    pub local_order_no: String,
    pub platform_code: String,
    pub external_order_no: Option<String>,
    pub status: DeliveryStatus,
    pub status_text: Option<String>,
    /// Last status label reported by the platform, verbatim.
    pub platform_status: Option<String>,
    pub merchant: Party,
    pub receiver: Party,
    pub items: Vec<DeliveryItem>,
    pub goods_amount: Decimal,
    pub delivery_fee: Decimal,
    pub total_amount: Decimal,
    pub remark: Option<String>,
    pub rider: Option<RiderInfo>,
    pub cancel_reason: Option<String>,
    /// Last delivery exception reported by the platform; never changes the status.
    pub exception: Option<DeliveryException>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_callback_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryException {
    pub exception_type: String,
    pub description: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Order as handed over by the order-management collaborator for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeliveryOrder {
    pub local_order_no: String,
    pub platform_code: String,
    pub merchant: Party,
    pub receiver: Party,
    pub items: Vec<DeliveryItem>,
    pub goods_amount: Decimal,
    pub delivery_fee: Decimal,
    pub total_amount: Decimal,
    pub remark: Option<String>,
}

impl NewDeliveryOrder {
    pub fn into_order(self, now: DateTime<Utc>) -> DeliveryOrder {
        DeliveryOrder {
            local_order_no: self.local_order_no,
            platform_code: self.platform_code,
            external_order_no: None,
            status: DeliveryStatus::Created,
            status_text: None,
            platform_status: None,
            merchant: self.merchant,
            receiver: self.receiver,
            items: self.items,
            goods_amount: self.goods_amount,
            delivery_fee: self.delivery_fee,
            total_amount: self.total_amount,
            remark: self.remark,
            rider: None,
            cancel_reason: None,
            exception: None,
            created_at: now,
            updated_at: now,
            last_callback_at: None,
        }
    }
}

/// Published whenever a transition is applied to a stored order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStatusChanged {
    pub local_order_no: String,
    pub external_order_no: Option<String>,
    pub platform_code: String,
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
    pub status_text: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Response envelope shared by the platforms and this service: `code == 0` is success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Envelope {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Envelope {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

impl Envelope<Value> {
    pub fn success() -> Self {
        Envelope {
            code: 0,
            message: "success".to_string(),
            data: None,
        }
    }
}

/// `data` of a successful receive-order acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveOrderAck {
    pub order_no: String,
    #[serde(default, deserialize_with = "opt_status_label")]
    pub status: Option<String>,
    #[serde(default)]
    pub status_text: Option<String>,
}

/// `data` of a status query response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub order_no: String,
    #[serde(deserialize_with = "status_label")]
    pub status: String,
    #[serde(default)]
    pub status_text: Option<String>,
    #[serde(default)]
    pub rider_name: Option<String>,
    #[serde(default)]
    pub rider_phone: Option<String>,
    #[serde(default)]
    pub rider_lat: Option<f64>,
    #[serde(default)]
    pub rider_lng: Option<f64>,
}

impl RemoteStatus {
    pub fn rider(&self) -> RiderInfo {
        RiderInfo {
            name: self.rider_name.clone(),
            phone: self.rider_phone.clone(),
            lat: self.rider_lat,
            lng: self.rider_lng,
        }
    }
}

/// Platforms report statuses either as names (`"accepted"`) or numeric codes (`1`).
pub fn status_label_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn status_label<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    status_label_of(&value).ok_or_else(|| serde::de::Error::custom("status must be a string or number"))
}

fn opt_status_label<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(status_label_of))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_accepts_numeric_or_named_status() {
        let named: Envelope<ReceiveOrderAck> =
            serde_json::from_str(r#"{"code":0,"message":"success","data":{"order_no":"DL1","status":"pending"}}"#)
                .unwrap();
        assert_eq!(named.data.unwrap().status.as_deref(), Some("pending"));

        let numeric: Envelope<RemoteStatus> =
            serde_json::from_str(r#"{"code":0,"data":{"order_no":"DL1","status":1,"rider_lat":39.9}}"#).unwrap();
        let data = numeric.data.unwrap();
        assert_eq!(data.status, "1");
        assert_eq!(data.rider().lat, Some(39.9));
        assert_eq!(numeric.message, "");
    }

    #[test]
    fn rejection_envelope_has_no_data() {
        let env: Envelope<ReceiveOrderAck> =
            serde_json::from_str(r#"{"code":1002,"message":"merchant closed"}"#).unwrap();
        assert!(!env.is_success());
        assert!(env.data.is_none());
    }

    #[test]
    fn rider_merge_keeps_known_fields() {
        let known = RiderInfo {
            name: Some("Li".into()),
            phone: Some("139".into()),
            lat: Some(1.0),
            lng: Some(2.0),
        };
        let update = RiderInfo {
            lat: Some(3.0),
            lng: Some(4.0),
            ..RiderInfo::default()
        };
        let merged = known.merged(&update);
        assert_eq!(merged.name.as_deref(), Some("Li"));
        assert_eq!(merged.lat, Some(3.0));
        assert!(RiderInfo::default().is_empty());
    }
}
