//! In-process backends for local runs and tests. Nothing survives a restart.

use super::{CallbackLogEntry, OrderStore, PlatformRegistry, RegistryError, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{DeliveryOrder, Platform};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryOrderStore {
    /// Keyed by `local_order_no`.
    orders: Arc<RwLock<HashMap<String, DeliveryOrder>>>,
    callback_logs: Arc<RwLock<Vec<CallbackLogEntry>>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn callback_logs(&self) -> Vec<CallbackLogEntry> {
        self.callback_logs.read().await.clone()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert_if_absent(&self, order: DeliveryOrder) -> Result<DeliveryOrder, StoreError> {
        let mut orders = self.orders.write().await;
        let stored = orders
            .entry(order.local_order_no.clone())
            .or_insert(order);
        Ok(stored.clone())
    }

    async fn find_by_local_no(&self, local_order_no: &str) -> Result<Option<DeliveryOrder>, StoreError> {
        Ok(self.orders.read().await.get(local_order_no).cloned())
    }

    async fn find_by_external_no(&self, external_order_no: &str) -> Result<Option<DeliveryOrder>, StoreError> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .find(|o| o.external_order_no.as_deref() == Some(external_order_no))
            .cloned())
    }

    async fn save_state(&self, order: &DeliveryOrder) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        if let Some(external) = order.external_order_no.as_deref() {
            let taken = orders
                .values()
                .any(|o| o.local_order_no != order.local_order_no && o.external_order_no.as_deref() == Some(external));
            if taken {
                return Err(StoreError::DuplicateExternal(external.to_string()));
            }
        }
        let stored = orders
            .get_mut(&order.local_order_no)
            .ok_or_else(|| StoreError::NotFound(order.local_order_no.clone()))?;
        *stored = order.clone();
        Ok(())
    }

    async fn list_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<DeliveryOrder>, StoreError> {
        let orders = self.orders.read().await;
        let mut out: Vec<DeliveryOrder> = match since {
            Some(since) => orders.values().filter(|o| o.updated_at >= since).cloned().collect(),
            None => orders.values().cloned().collect(),
        };
        match since {
            Some(_) => out.sort_by_key(|o| o.updated_at),
            None => {
                out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                out.truncate(100);
            }
        }
        Ok(out)
    }

    async fn append_callback_log(&self, entry: CallbackLogEntry) -> Result<(), StoreError> {
        self.callback_logs.write().await.push(entry);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPlatformRegistry {
    platforms: Arc<RwLock<HashMap<String, Platform>>>,
}

/// Platform entry in a `PLATFORMS_FILE`. Secrets are plain text here.
#[derive(Debug, Deserialize)]
struct PlatformSeed {
    code: String,
    display_name: Option<String>,
    api_key: String,
    api_secret: String,
    base_url: String,
    callback_url: Option<String>,
    ip_whitelist: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

impl MemoryPlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platforms(platforms: impl IntoIterator<Item = Platform>) -> Self {
        let map = platforms.into_iter().map(|p| (p.code.clone(), p)).collect();
        MemoryPlatformRegistry {
            platforms: Arc::new(RwLock::new(map)),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let seeds: Vec<PlatformSeed> = serde_json::from_str(raw)?;
        Ok(Self::with_platforms(seeds.into_iter().map(|s| Platform {
            display_name: s.display_name.unwrap_or_else(|| s.code.clone()),
            code: s.code,
            api_key: s.api_key,
            api_secret: SecretString::from(s.api_secret),
            base_url: s.base_url,
            callback_url: s.callback_url,
            ip_whitelist: s.ip_whitelist,
            active: s.active,
        })))
    }

    pub async fn from_json_file(path: &Path) -> Result<Self, std::io::Error> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[async_trait]
impl PlatformRegistry for MemoryPlatformRegistry {
    async fn lookup(&self, code: &str) -> Result<Platform, RegistryError> {
        self.platforms
            .read()
            .await
            .get(code)
            .filter(|p| p.active)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(code.to_string()))
    }

    async fn list_active(&self) -> Result<Vec<Platform>, RegistryError> {
        let mut list: Vec<Platform> = self
            .platforms
            .read()
            .await
            .values()
            .filter(|p| p.active)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(list)
    }
}
