//! Persistence seams: delivery orders plus callback audit log, and the platform registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{DeliveryOrder, Platform};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::CipherError;

pub mod memory;
pub mod mysql;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("order {0} not found")]
    NotFound(String),
    #[error("stored order {local_order_no} is unreadable: {reason}")]
    Corrupt { local_order_no: String, reason: String },
    #[error("external order number {0} is already bound to another order")]
    DuplicateExternal(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("platform {0} not found or inactive")]
    NotFound(String),
    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("platform {code} has an unreadable secret: {source}")]
    Secret {
        code: String,
        #[source]
        source: CipherError,
    },
}

/// Character widths of the platform-supplied text columns.
pub mod width {
    pub const ORDER_NO: usize = 64;
    pub const STATUS_TEXT: usize = 255;
    pub const PLATFORM_STATUS: usize = 32;
    pub const RIDER_NAME: usize = 64;
    pub const RIDER_PHONE: usize = 32;
    pub const CANCEL_REASON: usize = 255;
    pub const EXCEPTION_TYPE: usize = 64;
    pub const EXCEPTION_DESC: usize = 255;
    pub const LOG_MESSAGE: usize = 255;
}

/// Cut `value` to at most `max_chars` characters.
pub fn clip(mut value: String, max_chars: usize) -> String {
    if let Some((cut, _)) = value.char_indices().nth(max_chars) {
        value.truncate(cut);
    }
    value
}

/// Clip every platform-supplied field of `order` to its column width.
pub fn fit_columns(order: &mut DeliveryOrder) {
    let fit = |v: &mut Option<String>, max: usize| {
        if let Some(s) = v.take() {
            *v = Some(clip(s, max));
        }
    };
    fit(&mut order.status_text, width::STATUS_TEXT);
    fit(&mut order.platform_status, width::PLATFORM_STATUS);
    fit(&mut order.cancel_reason, width::CANCEL_REASON);
    if let Some(rider) = order.rider.as_mut() {
        fit(&mut rider.name, width::RIDER_NAME);
        fit(&mut rider.phone, width::RIDER_PHONE);
    }
    if let Some(exception) = order.exception.as_mut() {
        exception.exception_type = clip(std::mem::take(&mut exception.exception_type), width::EXCEPTION_TYPE);
        fit(&mut exception.description, width::EXCEPTION_DESC);
    }
}

/// One inbound callback as recorded for audit.
#[derive(Debug, Clone)]
pub struct CallbackLogEntry {
    pub kind: &'static str,
    pub external_order_no: Option<String>,
    pub platform_code: Option<String>,
    pub source_ip: Option<String>,
    pub result_code: i32,
    pub message: Option<String>,
    pub payload: Value,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Store `order` unless one with the same `local_order_no` exists; returns the stored order.
    async fn insert_if_absent(&self, order: DeliveryOrder) -> Result<DeliveryOrder, StoreError>;

    async fn find_by_local_no(&self, local_order_no: &str) -> Result<Option<DeliveryOrder>, StoreError>;

    async fn find_by_external_no(&self, external_order_no: &str) -> Result<Option<DeliveryOrder>, StoreError>;

    /// Write back the mutable state of an existing order.
    async fn save_state(&self, order: &DeliveryOrder) -> Result<(), StoreError>;

    /// Orders updated at or after `since`, oldest first; without `since`, the most recent ones.
    async fn list_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<DeliveryOrder>, StoreError>;

    async fn append_callback_log(&self, entry: CallbackLogEntry) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PlatformRegistry: Send + Sync {
    /// Active platform by code, with its secret decrypted.
    async fn lookup(&self, code: &str) -> Result<Platform, RegistryError>;

    async fn list_active(&self) -> Result<Vec<Platform>, RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_counts_characters_not_bytes() {
        assert_eq!(clip("骑手已到店".to_string(), 3), "骑手已");
        assert_eq!(clip("short".to_string(), 64), "short");
        assert_eq!(clip(String::new(), 0), "");
    }
}
