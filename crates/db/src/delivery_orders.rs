use crate::DbPool;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::FromRow;

#[derive(Debug, FromRow, Clone)]
pub struct DeliveryOrderRow {
    pub id: i64,
    pub local_order_no: String,
    pub platform_code: String,
    pub external_order_no: Option<String>,
    pub status: String,
    pub status_text: Option<String>,
    pub platform_status: Option<String>,
    pub merchant_name: String,
    pub merchant_address: String,
    pub merchant_phone: String,
    pub merchant_lat: Option<f64>,
    pub merchant_lng: Option<f64>,
    pub receiver_name: String,
    pub receiver_address: String,
    pub receiver_phone: String,
    pub receiver_lat: Option<f64>,
    pub receiver_lng: Option<f64>,
    pub items: Value,
    pub goods_amount: Decimal,
    pub delivery_fee: Decimal,
    pub total_amount: Decimal,
    pub remark: Option<String>,
    pub rider_name: Option<String>,
    pub rider_phone: Option<String>,
    pub rider_lat: Option<f64>,
    pub rider_lng: Option<f64>,
    pub cancel_reason: Option<String>,
    pub exception_type: Option<String>,
    pub exception_desc: Option<String>,
    pub exception_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub last_callback_at: Option<NaiveDateTime>,
}

const ORDER_COLUMNS: &str = r#"
  id, local_order_no, platform_code, external_order_no,
  status, status_text, platform_status,
  merchant_name, merchant_address, merchant_phone, merchant_lat, merchant_lng,
  receiver_name, receiver_address, receiver_phone, receiver_lat, receiver_lng,
  items, goods_amount, delivery_fee, total_amount, remark,
  rider_name, rider_phone, rider_lat, rider_lng, cancel_reason,
  exception_type, exception_desc, exception_at,
  created_at, updated_at, last_callback_at
"#;

#[derive(Debug)]
pub struct NewDeliveryOrderRow<'a> {
    pub local_order_no: &'a str,
    pub platform_code: &'a str,
    pub status: &'a str,
    pub merchant_name: &'a str,
    pub merchant_address: &'a str,
    pub merchant_phone: &'a str,
    pub merchant_lat: Option<f64>,
    pub merchant_lng: Option<f64>,
    pub receiver_name: &'a str,
    pub receiver_address: &'a str,
    pub receiver_phone: &'a str,
    pub receiver_lat: Option<f64>,
    pub receiver_lng: Option<f64>,
    pub items: &'a Value,
    pub goods_amount: Decimal,
    pub delivery_fee: Decimal,
    pub total_amount: Decimal,
    pub remark: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Insert the order unless a row with the same `local_order_no` already exists,
/// then return whatever is stored. Never overwrites an existing row.
pub async fn insert_delivery_order_if_absent(
    pool: &DbPool,
    order: NewDeliveryOrderRow<'_>,
) -> Result<DeliveryOrderRow, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO delivery_orders (
          local_order_no, platform_code, status,
          merchant_name, merchant_address, merchant_phone, merchant_lat, merchant_lng,
          receiver_name, receiver_address, receiver_phone, receiver_lat, receiver_lng,
          items, goods_amount, delivery_fee, total_amount, remark,
          created_at, updated_at
        )
        VALUES (?, ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?)
        ON DUPLICATE KEY UPDATE local_order_no = local_order_no
        "#,
    )
    .bind(order.local_order_no)
    .bind(order.platform_code)
    .bind(order.status)
    .bind(order.merchant_name)
    .bind(order.merchant_address)
    .bind(order.merchant_phone)
    .bind(order.merchant_lat)
    .bind(order.merchant_lng)
    .bind(order.receiver_name)
    .bind(order.receiver_address)
    .bind(order.receiver_phone)
    .bind(order.receiver_lat)
    .bind(order.receiver_lng)
    .bind(order.items)
    .bind(order.goods_amount)
    .bind(order.delivery_fee)
    .bind(order.total_amount)
    .bind(order.remark)
    .bind(order.created_at.naive_utc())
    .bind(order.created_at.naive_utc())
    .execute(pool)
    .await?;

    get_delivery_order_by_local_no(pool, order.local_order_no)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn get_delivery_order_by_local_no(
    pool: &DbPool,
    local_order_no: &str,
) -> Result<Option<DeliveryOrderRow>, sqlx::Error> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM delivery_orders WHERE local_order_no = ?");
    sqlx::query_as::<_, DeliveryOrderRow>(&sql)
        .bind(local_order_no)
        .fetch_optional(pool)
        .await
}

pub async fn get_delivery_order_by_external_no(
    pool: &DbPool,
    external_order_no: &str,
) -> Result<Option<DeliveryOrderRow>, sqlx::Error> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM delivery_orders WHERE external_order_no = ?");
    sqlx::query_as::<_, DeliveryOrderRow>(&sql)
        .bind(external_order_no)
        .fetch_optional(pool)
        .await
}

pub async fn list_delivery_orders_since(
    pool: &DbPool,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<DeliveryOrderRow>, sqlx::Error> {
    if let Some(since) = since {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM delivery_orders WHERE updated_at >= ? ORDER BY updated_at ASC LIMIT 500"
        );
        sqlx::query_as::<_, DeliveryOrderRow>(&sql)
            .bind(since.naive_utc())
            .fetch_all(pool)
            .await
    } else {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM delivery_orders ORDER BY created_at DESC LIMIT 100");
        sqlx::query_as::<_, DeliveryOrderRow>(&sql).fetch_all(pool).await
    }
}

/// Mutable part of a delivery order, written back after a validated transition.
#[derive(Debug)]
pub struct DeliveryOrderStateUpdate<'a> {
    pub local_order_no: &'a str,
    pub external_order_no: Option<&'a str>,
    pub status: &'a str,
    pub status_text: Option<&'a str>,
    pub platform_status: Option<&'a str>,
    pub rider_name: Option<&'a str>,
    pub rider_phone: Option<&'a str>,
    pub rider_lat: Option<f64>,
    pub rider_lng: Option<f64>,
    pub cancel_reason: Option<&'a str>,
    pub exception_type: Option<&'a str>,
    pub exception_desc: Option<&'a str>,
    pub exception_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_callback_at: Option<DateTime<Utc>>,
}

pub async fn update_delivery_order_state(
    pool: &DbPool,
    update: DeliveryOrderStateUpdate<'_>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE delivery_orders
        SET external_order_no = ?,
            status = ?,
            status_text = ?,
            platform_status = ?,
            rider_name = ?,
            rider_phone = ?,
            rider_lat = ?,
            rider_lng = ?,
            cancel_reason = ?,
            exception_type = ?,
            exception_desc = ?,
            exception_at = ?,
            updated_at = ?,
            last_callback_at = ?
        WHERE local_order_no = ?
        "#,
    )
    .bind(update.external_order_no)
    .bind(update.status)
    .bind(update.status_text)
    .bind(update.platform_status)
    .bind(update.rider_name)
    .bind(update.rider_phone)
    .bind(update.rider_lat)
    .bind(update.rider_lng)
    .bind(update.cancel_reason)
    .bind(update.exception_type)
    .bind(update.exception_desc)
    .bind(update.exception_at.map(|dt| dt.naive_utc()))
    .bind(update.updated_at.naive_utc())
    .bind(update.last_callback_at.map(|dt| dt.naive_utc()))
    .bind(update.local_order_no)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[derive(Debug)]
pub struct NewCallbackLog<'a> {
    pub kind: &'a str,
    pub external_order_no: Option<&'a str>,
    pub platform_code: Option<&'a str>,
    pub source_ip: Option<&'a str>,
    pub result_code: i32,
    pub message: Option<&'a str>,
    pub payload: &'a Value,
}

pub async fn insert_callback_log(pool: &DbPool, log: NewCallbackLog<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO delivery_callback_logs (
          kind, external_order_no, platform_code,
          source_ip, result_code, message, payload
        )
        VALUES (?, ?, ?,
                ?, ?, ?, ?)
        "#,
    )
    .bind(log.kind)
    .bind(log.external_order_no)
    .bind(log.platform_code)
    .bind(log.source_ip)
    .bind(log.result_code)
    .bind(log.message)
    .bind(log.payload)
    .execute(pool)
    .await?;
    Ok(())
}
