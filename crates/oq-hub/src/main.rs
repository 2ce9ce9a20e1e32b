use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oq_core::StoreGate;

mod api;
mod auth;
mod pipeline;
mod store;

use auth::directory::{Directory, DirectoryConfig};
use auth::tokens::{ServerJwt, StaticTokens, TokenChain, TokenEntry};
use auth::{IdentityResolver, PermissionLookup, TokenChecker};
use store::memory::MemoryStore;
use store::StorageExecutor;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "oq-hub", version, about = "Octopus query service")]
struct Args {
    /// Server bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Path to config file
    #[arg(long, default_value = "oq-hub.toml")]
    config: PathBuf,

    /// Print a signed server token for this user id and exit
    #[arg(long, value_name = "USER_ID")]
    issue_server_token: Option<String>,

    /// Lifetime of an issued token, in hours
    #[arg(long, default_value_t = 24)]
    token_ttl_hours: i64,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone)]
struct Config {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    directory: DirectoryConfig,
}

#[derive(Deserialize, Clone)]
struct ServerConfig {
    #[serde(default = "default_bind")]
    bind: String,
    /// Request header carrying the caller's session token.
    #[serde(default = "default_token_header")]
    token_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token_header: default_token_header(),
        }
    }
}

#[derive(Deserialize, Clone)]
struct StoreConfig {
    /// JSON array of device records. Missing file means an empty store.
    #[serde(default)]
    data_file: Option<PathBuf>,
    #[serde(default = "default_schema_min")]
    schema_version_min: i64,
    #[serde(default = "default_schema_max")]
    schema_version_max: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_file: None,
            schema_version_min: default_schema_min(),
            schema_version_max: default_schema_max(),
        }
    }
}

#[derive(Deserialize, Default, Clone)]
struct AuthConfig {
    /// Secret for signed service tokens. Empty disables them.
    #[serde(default)]
    server_secret: String,
    #[serde(default)]
    tokens: Vec<TokenEntry>,
}

fn default_bind() -> String {
    "127.0.0.1:9220".into()
}
fn default_token_header() -> String {
    "x-tidepool-session-token".into()
}
fn default_schema_min() -> i64 {
    StoreGate::default().schema_version_min
}
fn default_schema_max() -> i64 {
    StoreGate::default().schema_version_max
}

fn load_config(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!("No config at {:?}, using defaults", path);
        return Config::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to read config {:?}: {}", path, e);
            return Config::default();
        }
    };
    toml::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!("Failed to parse config {:?}: {}", path, e);
        Config::default()
    })
}

// =============================================================================
// Application State
// =============================================================================

/// Shared by every request; read-only once built.
struct AppState {
    config: Config,
    tokens: Arc<dyn TokenChecker>,
    identities: Arc<dyn IdentityResolver>,
    permissions: Arc<dyn PermissionLookup>,
    store: Arc<dyn StorageExecutor>,
}

impl AppState {
    fn gate(&self) -> StoreGate {
        StoreGate {
            schema_version_min: self.config.store.schema_version_min,
            schema_version_max: self.config.store.schema_version_max,
        }
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(api::status))
        .route("/query/data", post(api::query_data))
        .route("/upload/lastentry/:user_id", get(api::last_entry))
        .route(
            "/upload/lastentry/:user_id/:device_id",
            get(api::last_entry_device),
        )
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "oq_hub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args.config);

    if let Some(user_id) = &args.issue_server_token {
        if config.auth.server_secret.is_empty() {
            tracing::error!("auth.server_secret is not set, cannot sign tokens");
            std::process::exit(1);
        }
        let ttl = chrono::Duration::hours(args.token_ttl_hours);
        match ServerJwt::issue(&config.auth.server_secret, user_id, true, ttl) {
            Ok(token) => println!("{}", token),
            Err(e) => {
                tracing::error!("Failed to sign token: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let mut checkers: Vec<Arc<dyn TokenChecker>> =
        vec![Arc::new(StaticTokens::new(config.auth.tokens.clone()))];
    if !config.auth.server_secret.is_empty() {
        checkers.push(Arc::new(ServerJwt::new(&config.auth.server_secret)));
    }

    let store = match &config.store.data_file {
        Some(path) if path.exists() => match MemoryStore::from_file(path) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to load store: {}", e);
                std::process::exit(1);
            }
        },
        Some(path) => {
            tracing::warn!("Data file {:?} not found, starting empty", path);
            MemoryStore::new(Vec::new())
        }
        None => MemoryStore::new(Vec::new()),
    };
    tracing::info!("Store loaded with {} records", store.len());

    let directory = Arc::new(Directory::new(config.directory.clone()));

    let state = Arc::new(AppState {
        config: config.clone(),
        tokens: Arc::new(TokenChain::new(checkers)),
        identities: directory.clone(),
        permissions: directory,
        store: Arc::new(store),
    });

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let addr: SocketAddr = match bind.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("Invalid bind address {}: {}", bind, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Octopus query service listening on http://{}", addr);
    tracing::info!("  Query:  POST http://{}/query/data", addr);
    tracing::info!("  Token header: {}", config.server.token_header);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, router(state)).await {
        tracing::error!("Server error: {}", e);
    }
}
