use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Upper bound for `CALLBACK_TOLERANCE_SECS` (one day).
pub const MAX_CALLBACK_TOLERANCE_SECS: u64 = 86_400;
/// Upper bound for the outbound HTTP timeouts.
pub const MAX_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub enum StoreBackend {
    MySql {
        database_url: String,
        credential_key: SecretString,
    },
    /// Process-local store; platforms come from a JSON file.
    Memory { platforms_file: Option<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub store: StoreBackend,
    pub public_base_url: String,
    pub callback_tolerance: Duration,
    pub dispatch_timeout: Duration,
    pub query_timeout: Duration,
    /// Take the client address from `X-Forwarded-For` (only behind a trusted proxy).
    pub trust_forwarded_for: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let store = match get("GATEWAY_STORE").as_deref().unwrap_or("mysql") {
            "mysql" => StoreBackend::MySql {
                database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                credential_key: get("DELIVERY_CRED_ENC_KEY")
                    .map(SecretString::from)
                    .ok_or(ConfigError::Missing("DELIVERY_CRED_ENC_KEY"))?,
            },
            "memory" => StoreBackend::Memory {
                platforms_file: get("PLATFORMS_FILE").map(PathBuf::from),
            },
            other => {
                return Err(ConfigError::Invalid {
                    name: "GATEWAY_STORE",
                    reason: format!("expected mysql or memory, got {other}"),
                })
            }
        };

        Ok(GatewayConfig {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            store,
            public_base_url: get("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080".to_string())
                .trim_end_matches('/')
                .to_string(),
            callback_tolerance: secs(&get, "CALLBACK_TOLERANCE_SECS", 300, MAX_CALLBACK_TOLERANCE_SECS)?,
            dispatch_timeout: secs(&get, "DISPATCH_TIMEOUT_SECS", 10, MAX_TIMEOUT_SECS)?,
            query_timeout: secs(&get, "QUERY_TIMEOUT_SECS", 5, MAX_TIMEOUT_SECS)?,
            trust_forwarded_for: matches!(get("TRUST_FORWARDED_FOR").as_deref(), Some("1" | "true" | "yes")),
        })
    }

    /// Callback URL handed to platforms that have none configured.
    pub fn default_callback_url(&self) -> String {
        format!("{}/api/delivery/callback", self.public_base_url)
    }
}

fn secs<G>(get: &G, name: &'static str, default: u64, max: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(name) else {
        return Ok(Duration::from_secs(default));
    };
    let value = raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })?;
    if value > max {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("{value} exceeds the maximum of {max} seconds"),
        });
    }
    Ok(Duration::from_secs(value))
}

/// Redact password in DATABASE_URL for safe logging.
pub fn redact_password(url: &str) -> String {
    if let Some(at) = url.rfind('@') {
        if let Some(colon) = url.find("://").map(|i| i + 3).filter(|&i| i < at) {
            if let Some(pw_start) = url[colon..at].find(':').map(|j| colon + j + 1) {
                return format!("{}***{}", &url[..pw_start], &url[at..]);
            }
        }
    }
    url.to_string()
}
