use super::{CallbackLogEntry, OrderStore, PlatformRegistry, RegistryError, StoreError};
use crate::crypto::SecretCipher;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use db::{DbPool, DeliveryOrderRow, PlatformRow};
use domain::{DeliveryException, DeliveryItem, DeliveryOrder, DeliveryStatus, Party, Platform, RiderInfo};

pub struct MySqlOrderStore {
    pool: DbPool,
}

impl MySqlOrderStore {
    pub fn new(pool: DbPool) -> Self {
        MySqlOrderStore { pool }
    }
}

fn utc(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(dt, Utc)
}

fn order_from_row(row: DeliveryOrderRow) -> Result<DeliveryOrder, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        local_order_no: row.local_order_no.clone(),
        reason,
    };
    let status: DeliveryStatus = row.status.parse().map_err(|e| corrupt(format!("{e}")))?;
    let items: Vec<DeliveryItem> =
        serde_json::from_value(row.items.clone()).map_err(|e| corrupt(format!("items: {e}")))?;
    let rider = RiderInfo {
        name: row.rider_name.clone(),
        phone: row.rider_phone.clone(),
        lat: row.rider_lat,
        lng: row.rider_lng,
    };
    let exception = match (row.exception_type.clone(), row.exception_at) {
        (Some(exception_type), Some(at)) => Some(DeliveryException {
            exception_type,
            description: row.exception_desc.clone(),
            reported_at: utc(at),
        }),
        _ => None,
    };

    Ok(DeliveryOrder {
        local_order_no: row.local_order_no,
        platform_code: row.platform_code,
        external_order_no: row.external_order_no,
        status,
        status_text: row.status_text,
        platform_status: row.platform_status,
        merchant: Party {
            name: row.merchant_name,
            address: row.merchant_address,
            phone: row.merchant_phone,
            lat: row.merchant_lat,
            lng: row.merchant_lng,
        },
        receiver: Party {
            name: row.receiver_name,
            address: row.receiver_address,
            phone: row.receiver_phone,
            lat: row.receiver_lat,
            lng: row.receiver_lng,
        },
        items,
        goods_amount: row.goods_amount,
        delivery_fee: row.delivery_fee,
        total_amount: row.total_amount,
        remark: row.remark,
        rider: (!rider.is_empty()).then_some(rider),
        cancel_reason: row.cancel_reason,
        exception,
        created_at: utc(row.created_at),
        updated_at: utc(row.updated_at),
        last_callback_at: row.last_callback_at.map(utc),
    })
}

fn is_duplicate_key(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23000"),
        _ => false,
    }
}

#[async_trait]
impl OrderStore for MySqlOrderStore {
    async fn insert_if_absent(&self, order: DeliveryOrder) -> Result<DeliveryOrder, StoreError> {
        let items = serde_json::to_value(&order.items).map_err(|e| StoreError::Corrupt {
            local_order_no: order.local_order_no.clone(),
            reason: format!("items: {e}"),
        })?;
        let row = db::insert_delivery_order_if_absent(
            &self.pool,
            db::NewDeliveryOrderRow {
                local_order_no: &order.local_order_no,
                platform_code: &order.platform_code,
                status: order.status.as_str(),
                merchant_name: &order.merchant.name,
                merchant_address: &order.merchant.address,
                merchant_phone: &order.merchant.phone,
                merchant_lat: order.merchant.lat,
                merchant_lng: order.merchant.lng,
                receiver_name: &order.receiver.name,
                receiver_address: &order.receiver.address,
                receiver_phone: &order.receiver.phone,
                receiver_lat: order.receiver.lat,
                receiver_lng: order.receiver.lng,
                items: &items,
                goods_amount: order.goods_amount,
                delivery_fee: order.delivery_fee,
                total_amount: order.total_amount,
                remark: order.remark.as_deref(),
                created_at: order.created_at,
            },
        )
        .await?;
        order_from_row(row)
    }

    async fn find_by_local_no(&self, local_order_no: &str) -> Result<Option<DeliveryOrder>, StoreError> {
        db::get_delivery_order_by_local_no(&self.pool, local_order_no)
            .await?
            .map(order_from_row)
            .transpose()
    }

    async fn find_by_external_no(&self, external_order_no: &str) -> Result<Option<DeliveryOrder>, StoreError> {
        db::get_delivery_order_by_external_no(&self.pool, external_order_no)
            .await?
            .map(order_from_row)
            .transpose()
    }

    async fn save_state(&self, order: &DeliveryOrder) -> Result<(), StoreError> {
        let rider = order.rider.clone().unwrap_or_default();
        let exception = order.exception.as_ref();
        let update = db::DeliveryOrderStateUpdate {
            local_order_no: &order.local_order_no,
            external_order_no: order.external_order_no.as_deref(),
            status: order.status.as_str(),
            status_text: order.status_text.as_deref(),
            platform_status: order.platform_status.as_deref(),
            rider_name: rider.name.as_deref(),
            rider_phone: rider.phone.as_deref(),
            rider_lat: rider.lat,
            rider_lng: rider.lng,
            cancel_reason: order.cancel_reason.as_deref(),
            exception_type: exception.map(|e| e.exception_type.as_str()),
            exception_desc: exception.and_then(|e| e.description.as_deref()),
            exception_at: exception.map(|e| e.reported_at),
            updated_at: order.updated_at,
            last_callback_at: order.last_callback_at,
        };
        match db::update_delivery_order_state(&self.pool, update).await {
            // MySQL reports 0 affected rows when nothing changed, so confirm the row exists.
            Ok(0) => match db::get_delivery_order_by_local_no(&self.pool, &order.local_order_no).await? {
                Some(_) => Ok(()),
                None => Err(StoreError::NotFound(order.local_order_no.clone())),
            },
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(StoreError::DuplicateExternal(
                order.external_order_no.clone().unwrap_or_default(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<DeliveryOrder>, StoreError> {
        db::list_delivery_orders_since(&self.pool, since)
            .await?
            .into_iter()
            .map(order_from_row)
            .collect()
    }

    async fn append_callback_log(&self, entry: CallbackLogEntry) -> Result<(), StoreError> {
        db::insert_callback_log(
            &self.pool,
            db::NewCallbackLog {
                kind: entry.kind,
                external_order_no: entry.external_order_no.as_deref(),
                platform_code: entry.platform_code.as_deref(),
                source_ip: entry.source_ip.as_deref(),
                result_code: entry.result_code,
                message: entry.message.as_deref(),
                payload: &entry.payload,
            },
        )
        .await?;
        Ok(())
    }
}

/// Platforms from `delivery_platforms`, secrets decrypted on every lookup so
/// rotations apply without a restart.
pub struct MySqlPlatformRegistry {
    pool: DbPool,
    cipher: SecretCipher,
}

impl MySqlPlatformRegistry {
    pub fn new(pool: DbPool, cipher: SecretCipher) -> Self {
        MySqlPlatformRegistry { pool, cipher }
    }

    fn platform_from_row(&self, row: PlatformRow) -> Result<Platform, RegistryError> {
        let api_secret = self
            .cipher
            .decrypt(&row.api_secret_enc)
            .map_err(|source| RegistryError::Secret {
                code: row.code.clone(),
                source,
            })?;
        Ok(Platform {
            code: row.code,
            display_name: row.display_name,
            api_key: row.api_key,
            api_secret,
            base_url: row.base_url,
            callback_url: row.callback_url.filter(|u| !u.trim().is_empty()),
            ip_whitelist: row.ip_whitelist,
            active: row.is_active,
        })
    }
}

#[async_trait]
impl PlatformRegistry for MySqlPlatformRegistry {
    async fn lookup(&self, code: &str) -> Result<Platform, RegistryError> {
        let row = db::find_active_platform_by_code(&self.pool, code)
            .await?
            .ok_or_else(|| RegistryError::NotFound(code.to_string()))?;
        self.platform_from_row(row)
    }

    async fn list_active(&self) -> Result<Vec<Platform>, RegistryError> {
        db::list_active_platforms(&self.pool)
            .await?
            .into_iter()
            .map(|row| self.platform_from_row(row))
            .collect()
    }
}
