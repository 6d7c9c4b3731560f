//! Canonical parameter signing shared with the delivery platforms.
//!
//! Canonical form: drop `sign`, nulls, empty strings, objects and arrays; sort
//! the remaining keys by byte order; join trimmed `key=value` pairs with `&`.
//! The signature is lowercase hex HMAC-SHA256 of that string under the
//! platform secret.
//!
//! Values are rendered once, by type:
//! - text as-is
//! - integers in decimal
//! - money (`Decimal`) normalized, so `12.50` -> `12.5` and `10.00` -> `10`
//! - coordinates (`f64`) with `Display`, so `5.0` -> `5`, never an exponent
//! - booleans as `true` / `false`
//!
//! Inbound JSON numbers follow the same rules, so a value signed here verifies
//! on the platform side and vice versa.

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};
use sha2::Sha256;
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const SIGN_KEY: &str = "sign";

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Int(i64),
    Decimal(Decimal),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    /// Value as it enters the canonical string; `None` means the key is skipped.
    pub fn canonical(&self) -> Option<String> {
        match self {
            Scalar::Text(s) if s.is_empty() => None,
            Scalar::Text(s) => Some(s.trim().to_string()),
            Scalar::Int(n) => Some(n.to_string()),
            Scalar::Decimal(d) => Some(d.normalize().to_string()),
            Scalar::Float(f) if !f.is_finite() => None,
            Scalar::Float(f) => Some(f.to_string()),
            Scalar::Bool(b) => Some(b.to_string()),
        }
    }

    /// Value as it is sent in a JSON body. Numbers stay numbers.
    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Text(s) => Value::String(s.clone()),
            Scalar::Int(n) => Value::from(*n),
            Scalar::Decimal(d) => {
                let text = d.normalize().to_string();
                text.parse::<Number>()
                    .map(Value::Number)
                    .unwrap_or(Value::String(text))
            }
            Scalar::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Scalar::Bool(b) => Value::Bool(*b),
        }
    }

    fn from_json(value: &Value) -> Option<Scalar> {
        match value {
            Value::String(s) => Some(Scalar::Text(s.clone())),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Scalar::Int(i))
                } else if n.is_u64() {
                    Some(Scalar::Text(n.to_string()))
                } else {
                    n.as_f64().map(Scalar::Float)
                }
            }
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

/// Parameters of one signed message, keyed by wire name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignParams {
    entries: BTreeMap<String, Scalar>,
}

impl SignParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Scalar) {
        self.entries.insert(key.into(), value);
    }

    pub fn text(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, Scalar::Text(value.into()));
        self
    }

    pub fn opt_text(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.text(key, v),
            None => self,
        }
    }

    pub fn int(mut self, key: &str, value: i64) -> Self {
        self.insert(key, Scalar::Int(value));
        self
    }

    pub fn decimal(mut self, key: &str, value: Decimal) -> Self {
        self.insert(key, Scalar::Decimal(value));
        self
    }

    pub fn opt_float(mut self, key: &str, value: Option<f64>) -> Self {
        if let Some(v) = value {
            self.insert(key, Scalar::Float(v));
        }
        self
    }

    /// Scalar fields of an inbound JSON object. Nested values and nulls are not
    /// signed, so they are dropped here.
    pub fn from_json_object(object: &Map<String, Value>) -> Self {
        let entries = object
            .iter()
            .filter_map(|(k, v)| Scalar::from_json(v).map(|s| (k.clone(), s)))
            .collect();
        SignParams { entries }
    }

    pub fn canonical_string(&self) -> String {
        self.entries
            .iter()
            .filter(|(k, _)| k.as_str() != SIGN_KEY)
            .filter_map(|(k, v)| v.canonical().map(|v| format!("{k}={v}")))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Sign last: the returned request owns the parameters, so nothing can be
    /// added after the signature is computed.
    pub fn into_signed(self, secret: &str) -> SignedRequest {
        let sign = sign(&self, secret);
        SignedRequest { params: self, sign }
    }
}

#[derive(Debug, Clone)]
pub struct SignedRequest {
    params: SignParams,
    sign: String,
}

impl SignedRequest {
    pub fn sign(&self) -> &str {
        &self.sign
    }

    #[cfg(test)]
    pub fn params(&self) -> &SignParams {
        &self.params
    }

    pub fn json_body(&self) -> Value {
        let mut body = Map::new();
        for (k, v) in &self.params.entries {
            if k != SIGN_KEY {
                body.insert(k.clone(), v.to_json());
            }
        }
        body.insert(SIGN_KEY.to_string(), Value::String(self.sign.clone()));
        Value::Object(body)
    }

    /// Query-string pairs. Skipped values are left out so the receiver
    /// canonicalizes exactly what was signed.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .params
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != SIGN_KEY)
            .filter_map(|(k, v)| v.canonical().map(|v| (k.clone(), v)))
            .collect();
        pairs.push((SIGN_KEY.to_string(), self.sign.clone()));
        pairs
    }
}

pub fn sign(params: &SignParams, secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any size"),
    };
    mac.update(params.canonical_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify(params: &SignParams, provided_sign: &str, secret: &str) -> bool {
    let expected = sign(params, secret);
    let provided = provided_sign.trim();
    expected.len() == provided.len() && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn hmac_hex(secret: &str, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn canonical_string_sorts_and_skips() {
        let params = SignParams::new()
            .text("platform_code", "banxia")
            .int("timestamp", 1_700_000_000)
            .text("remark", "")
            .text("receiver_name", "  Wang  ")
            .text("sign", "stale")
            .opt_float("receiver_lat", None)
            .opt_float("merchant_lat", Some(39.908692));
        assert_eq!(
            params.canonical_string(),
            "merchant_lat=39.908692&platform_code=banxia&receiver_name=Wang&timestamp=1700000000"
        );
    }

    #[test]
    fn numeric_rendering_is_fixed() {
        let params = SignParams::new()
            .decimal("a", Decimal::from_str("12.50").unwrap())
            .decimal("b", Decimal::from_str("10.00").unwrap())
            .decimal("c", Decimal::from_str("0.1").unwrap())
            .opt_float("d", Some(5.0))
            .opt_float("e", Some(1e21));
        assert_eq!(
            params.canonical_string(),
            "a=12.5&b=10&c=0.1&d=5&e=1000000000000000000000"
        );
    }

    #[test]
    fn empty_set_signs_empty_string() {
        let params = SignParams::new();
        assert_eq!(params.canonical_string(), "");
        assert_eq!(sign(&params, "sk_test"), hmac_hex("sk_test", ""));
    }

    #[test]
    fn sign_matches_plain_hmac_of_canonical_string() {
        let params = SignParams::new().text("order_no", "DL1").text("status", "accepted").int("timestamp", 100);
        assert_eq!(
            sign(&params, "sk_test"),
            hmac_hex("sk_test", "order_no=DL1&status=accepted&timestamp=100")
        );
    }

    #[test]
    fn verify_accepts_own_signature() {
        let params = SignParams::new()
            .text("external_order_no", "TEST123")
            .decimal("total_amount", Decimal::from_str("28.00").unwrap())
            .opt_float("receiver_lng", Some(116.407477));
        let signature = sign(&params, "sk_test");
        assert!(verify(&params, &signature, "sk_test"));
    }

    #[test]
    fn mutation_after_signing_breaks_verification() {
        let params = SignParams::new().text("order_no", "DL1").text("status", "accepted").int("timestamp", 100);
        let signature = sign(&params, "sk_test");

        let changed_value = params.clone().text("status", "completed");
        assert!(!verify(&changed_value, &signature, "sk_test"));

        let changed_number = params.clone().int("timestamp", 101);
        assert!(!verify(&changed_number, &signature, "sk_test"));
    }

    #[test]
    fn wrong_secret_or_garbage_fails() {
        let params = SignParams::new().text("order_no", "DL1");
        let signature = sign(&params, "sk_test");
        assert!(!verify(&params, &signature, "sk_other"));
        assert!(!verify(&params, "deadbeef", "sk_test"));
        assert!(!verify(&params, "", "sk_test"));
    }

    #[test]
    fn inbound_json_canonicalizes_like_outbound() {
        let outbound = SignParams::new()
            .text("order_no", "DL1")
            .int("timestamp", 1_700_000_000)
            .opt_float("rider_lat", Some(39.915))
            .decimal("delivery_fee", Decimal::from_str("5.00").unwrap());
        let signed = outbound.into_signed("sk_test");
        let body = signed.json_body();

        let mut inbound = body.as_object().unwrap().clone();
        inbound.insert("rider_info".to_string(), json!({"name": "Zhang"}));
        inbound.insert("tags".to_string(), json!(["a"]));
        inbound.insert("note".to_string(), Value::Null);
        let provided = inbound["sign"].as_str().unwrap().to_string();

        assert!(verify(&SignParams::from_json_object(&inbound), &provided, "sk_test"));
    }

    #[test]
    fn float_written_as_integer_still_verifies() {
        // A platform may send `5.0` for a value we render as `5`.
        let body: Value = serde_json::from_str(r#"{"order_no":"DL1","rider_lat":5.0}"#).unwrap();
        let params = SignParams::from_json_object(body.as_object().unwrap());
        assert_eq!(params.canonical_string(), "order_no=DL1&rider_lat=5");
    }

    #[test]
    fn query_pairs_carry_sign_last() {
        let signed = SignParams::new()
            .text("platform_code", "banxia")
            .text("order_no", "DL1")
            .int("timestamp", 7)
            .into_signed("sk_test");
        let pairs = signed.query_pairs();
        assert_eq!(pairs.last().unwrap().0, "sign");
        assert_eq!(pairs.len(), 4);
        assert_eq!(signed.json_body()["timestamp"], json!(7));
    }
}
