//! The delivery gateway: dispatch, inbound callbacks, status query and cancel.
//!
//! Every state change goes through [`Gateway::apply_observation`] while the
//! per-order lock is held, so the transition table is the single gate for
//! callbacks and remote calls alike.

use chrono::{DateTime, Utc};
use domain::{DeliveryOrder, DeliveryStatus, DeliveryStatusChanged, Platform, PlatformSummary, RiderInfo};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::delivery_connectors::PlatformConnector;
use crate::locks::OrderLocks;
use crate::store::{self, OrderStore, PlatformRegistry, RegistryError, StoreError};

mod callback;
mod dispatch;
mod remote;

pub use callback::{CallbackAck, CallbackError, CallbackSource};
pub use dispatch::{DispatchError, DispatchOutcome};
pub use remote::{CancelAck, CancelError, QueryError, RemoteCallError};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Callback URL sent to platforms that have none of their own.
    pub default_callback_url: String,
    pub callback_tolerance: chrono::Duration,
}

pub struct Gateway {
    orders: Arc<dyn OrderStore>,
    platforms: Arc<dyn PlatformRegistry>,
    connector: Arc<dyn PlatformConnector>,
    locks: OrderLocks,
    events: broadcast::Sender<DeliveryStatusChanged>,
    settings: GatewaySettings,
}

/// A status reported by the platform (callback, ack or query answer) plus
/// whatever came with it.
#[derive(Debug, Clone)]
pub(crate) struct Observation {
    pub status: DeliveryStatus,
    pub status_text: Option<String>,
    pub platform_status: Option<String>,
    pub rider: Option<RiderInfo>,
    pub external_order_no: Option<String>,
    pub cancel_reason: Option<String>,
    pub via_callback: bool,
}

impl Observation {
    pub fn status(status: DeliveryStatus) -> Self {
        Observation {
            status,
            status_text: None,
            platform_status: None,
            rider: None,
            external_order_no: None,
            cancel_reason: None,
            via_callback: false,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Applied {
    Changed(DeliveryOrder),
    /// Transition not allowed from the current status; nothing was written.
    Unchanged(DeliveryOrder),
}

impl Applied {
    pub fn order(&self) -> &DeliveryOrder {
        match self {
            Applied::Changed(o) | Applied::Unchanged(o) => o,
        }
    }
}

impl Gateway {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        platforms: Arc<dyn PlatformRegistry>,
        connector: Arc<dyn PlatformConnector>,
        settings: GatewaySettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Gateway {
            orders,
            platforms,
            connector,
            locks: OrderLocks::new(),
            events,
            settings,
        }
    }

    /// Applied transitions, for the order-management side.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryStatusChanged> {
        self.events.subscribe()
    }

    pub async fn platform(&self, code: &str) -> Result<Platform, RegistryError> {
        self.platforms.lookup(code).await
    }

    pub async fn list_platforms(&self) -> Result<Vec<PlatformSummary>, RegistryError> {
        let platforms = self.platforms.list_active().await?;
        Ok(platforms.iter().map(PlatformSummary::from).collect())
    }

    pub async fn order(&self, local_order_no: &str) -> Result<Option<DeliveryOrder>, StoreError> {
        self.orders.find_by_local_no(local_order_no).await
    }

    pub async fn orders_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<DeliveryOrder>, StoreError> {
        self.orders.list_since(since).await
    }

    /// Caller must hold the order lock and pass the order as just re-read.
    pub(crate) async fn apply_observation(
        &self,
        current: DeliveryOrder,
        observation: Observation,
        now: DateTime<Utc>,
    ) -> Result<Applied, StoreError> {
        let from = current.status;
        if !from.can_transition(observation.status) {
            tracing::debug!(
                local_order_no = %current.local_order_no,
                from = %from,
                to = %observation.status,
                "transition not allowed; ignoring"
            );
            return Ok(Applied::Unchanged(current));
        }

        let mut next = current;
        next.status = observation.status;
        next.status_text = observation.status_text;
        if observation.platform_status.is_some() {
            next.platform_status = observation.platform_status;
        }
        if observation.external_order_no.is_some() {
            next.external_order_no = observation.external_order_no;
        }
        if let Some(rider) = observation.rider.filter(|r| !r.is_empty()) {
            next.rider = Some(next.rider.take().unwrap_or_default().merged(&rider));
        }
        if observation.cancel_reason.is_some() {
            next.cancel_reason = observation.cancel_reason;
        }
        next.updated_at = now;
        if observation.via_callback {
            next.last_callback_at = Some(now);
        }

        if let Err(e) = self.persist(&mut next).await {
            tracing::error!(local_order_no = %next.local_order_no, "failed to persist transition: {}", e);
            return Err(e);
        }
        tracing::info!(
            local_order_no = %next.local_order_no,
            external_order_no = next.external_order_no.as_deref().unwrap_or(""),
            platform = %next.platform_code,
            "delivery status {} -> {}",
            from,
            next.status
        );

        // No subscribers is fine.
        let _ = self.events.send(DeliveryStatusChanged {
            local_order_no: next.local_order_no.clone(),
            external_order_no: next.external_order_no.clone(),
            platform_code: next.platform_code.clone(),
            from,
            to: next.status,
            status_text: next.status_text.clone(),
            occurred_at: now,
        });
        Ok(Applied::Changed(next))
    }

    /// Write back `order` with platform-supplied text fitted to its columns.
    async fn persist(&self, order: &mut DeliveryOrder) -> Result<(), StoreError> {
        store::fit_columns(order);
        self.orders.save_state(order).await
    }

    /// Re-read `local_order_no` under its lock.
    async fn reload(&self, local_order_no: &str) -> Result<DeliveryOrder, StoreError> {
        self.orders
            .find_by_local_no(local_order_no)
            .await?
            .ok_or_else(|| StoreError::NotFound(local_order_no.to_string()))
    }
}
