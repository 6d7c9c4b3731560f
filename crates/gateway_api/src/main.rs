mod config;
mod crypto;
mod delivery_connectors;
mod gateway;
mod ip_allow;
mod locks;
mod routes;
mod signing;
mod state;
mod store;

use axum::{extract::State, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

use config::{redact_password, GatewayConfig, StoreBackend};
use crypto::SecretCipher;
use delivery_connectors::SignedRestConnector;
use gateway::{Gateway, GatewaySettings};
use state::AppState;
use store::memory::{MemoryOrderStore, MemoryPlatformRegistry};
use store::mysql::{MySqlOrderStore, MySqlPlatformRegistry};
use store::{OrderStore, PlatformRegistry};

/// Gateway between the order system and external delivery platforms.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the stored form of a platform API secret (delivery_platforms.api_secret_enc),
    /// encrypted with DELIVERY_CRED_ENC_KEY
    EncryptSecret {
        /// Plaintext API secret
        secret: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load .env from workspace root (when running from project root)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Some(Command::EncryptSecret { secret }) = cli.command {
        encrypt_secret_command(&secret);
        return;
    }

    let config = match GatewayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("configuration error: {}", e);
            return;
        }
    };

    let (orders, platforms, store_backend): (Arc<dyn OrderStore>, Arc<dyn PlatformRegistry>, &'static str) =
        match &config.store {
            StoreBackend::MySql {
                database_url,
                credential_key,
            } => {
                let cipher = match SecretCipher::from_base64_key(credential_key.expose_secret()) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!("DELIVERY_CRED_ENC_KEY: {}", e);
                        return;
                    }
                };
                let pool = match db::connect(database_url).await {
                    Ok(pool) => pool,
                    Err(e) => {
                        tracing::error!("Database: not available: {}", e);
                        tracing::error!("DATABASE_URL (redacted): {}", redact_password(database_url));
                        return;
                    }
                };
                if let Err(e) = db::run_migrations(&pool).await {
                    tracing::error!("Migrations failed: {}", e);
                    return;
                }
                tracing::info!("Database: connected, migrations applied");
                let orders: Arc<dyn OrderStore> = Arc::new(MySqlOrderStore::new(pool.clone()));
                let platforms: Arc<dyn PlatformRegistry> = Arc::new(MySqlPlatformRegistry::new(pool, cipher));
                (orders, platforms, "mysql")
            }
            StoreBackend::Memory { platforms_file } => {
                let registry = match platforms_file {
                    Some(path) => match MemoryPlatformRegistry::from_json_file(path).await {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::error!("PLATFORMS_FILE {}: {}", path.display(), e);
                            return;
                        }
                    },
                    None => {
                        tracing::warn!("memory store without PLATFORMS_FILE: no platforms configured");
                        MemoryPlatformRegistry::new()
                    }
                };
                tracing::warn!("using in-memory store; orders are lost on restart");
                let orders: Arc<dyn OrderStore> = Arc::new(MemoryOrderStore::new());
                let platforms: Arc<dyn PlatformRegistry> = Arc::new(registry);
                (orders, platforms, "memory")
            }
        };

    let callback_tolerance = match chrono::Duration::from_std(config.callback_tolerance) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("CALLBACK_TOLERANCE_SECS: {}", e);
            return;
        }
    };
    let gateway = Arc::new(Gateway::new(
        orders,
        platforms,
        Arc::new(SignedRestConnector::new(config.dispatch_timeout, config.query_timeout)),
        GatewaySettings {
            default_callback_url: config.default_callback_url(),
            callback_tolerance,
        },
    ));
    tokio::spawn(log_status_changes(gateway.subscribe()));

    let state = AppState {
        gateway,
        store_backend,
        trust_forwarded_for: config.trust_forwarded_for,
    };

    // API routes under /api; state applied once so all handlers see the same AppState.
    let api = Router::new()
        .route("/health", get(health))
        .merge(routes::router())
        .with_state(state);
    let app = Router::new().nest("/api", api);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("cannot bind {}: {}", config.bind_addr, e);
            return;
        }
    };
    tracing::info!("listening on http://{}", config.bind_addr);
    if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await {
        tracing::error!("server error: {}", e);
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "store": state.store_backend }))
}

async fn log_status_changes(mut events: broadcast::Receiver<domain::DeliveryStatusChanged>) {
    loop {
        match events.recv().await {
            Ok(change) => tracing::info!(
                local_order_no = %change.local_order_no,
                platform = %change.platform_code,
                "status changed {} -> {}",
                change.from,
                change.to
            ),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("status change log lagged by {} events", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn encrypt_secret_command(plaintext: &str) {
    let key = match std::env::var("DELIVERY_CRED_ENC_KEY") {
        Ok(k) => secrecy::SecretString::from(k),
        Err(_) => {
            eprintln!("DELIVERY_CRED_ENC_KEY is required");
            return;
        }
    };
    match crypto::encrypt_for_storage(&key, plaintext) {
        Ok(enc) => println!("{enc}"),
        Err(e) => eprintln!("encrypt failed: {e}"),
    }
}
