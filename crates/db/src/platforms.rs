use crate::DbPool;
use sqlx::FromRow;

/// Row in `delivery_platforms`. The secret is stored encrypted and only decrypted
/// by the gateway when a platform is resolved for a request.
#[derive(Debug, FromRow, Clone)]
pub struct PlatformRow {
    pub id: i64,
    pub code: String,
    pub display_name: String,
    pub api_key: String,
    pub api_secret_enc: String,
    pub base_url: String,
    pub callback_url: Option<String>,
    pub ip_whitelist: Option<String>,
    pub is_active: bool,
}

/// Active platform by code. Inactive platforms are reported as absent.
pub async fn find_active_platform_by_code(
    pool: &DbPool,
    code: &str,
) -> Result<Option<PlatformRow>, sqlx::Error> {
    sqlx::query_as::<_, PlatformRow>(
        r#"
        SELECT
          id, code, display_name, api_key, api_secret_enc,
          base_url, callback_url, ip_whitelist, is_active
        FROM delivery_platforms
        WHERE code = ? AND is_active = 1
        "#,
    )
    .bind(code)
    .fetch_optional(pool)
    .await
}

pub async fn list_active_platforms(pool: &DbPool) -> Result<Vec<PlatformRow>, sqlx::Error> {
    sqlx::query_as::<_, PlatformRow>(
        r#"
        SELECT
          id, code, display_name, api_key, api_secret_enc,
          base_url, callback_url, ip_whitelist, is_active
        FROM delivery_platforms
        WHERE is_active = 1
        ORDER BY code ASC
        "#,
    )
    .fetch_all(pool)
    .await
}
