//! Renova Sync Server
//!
//! Reference remote store for Renova clients: per-collection record tables
//! over HTTP plus realtime change notifications over WebSocket.
//!
//! # Configuration
//!
//! Environment variables:
//! - `RENOVA_PORT`: Port to listen on (default: 8080)
//! - `RENOVA_SERVER_DATA_DIR`: Directory to store tables (default: ~/.local/share/renova-server)
//! - `RENOVA_SERVER_CONFIG`: Path to config file (default: ~/.config/renova-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     name: "loja-centro"
//! ```
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `GET /collections/{collection}/records`: Full table contents
//! - `POST /collections/{collection}/records`: Upsert a JSON array of records by id
//! - `DELETE /collections/{collection}/records/{id}`: Delete one record
//! - `GET /realtime/{collection}`: WebSocket stream of insert/update/delete messages

mod hub;
mod storage;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Extension, Json, Router,
};
use futures::{SinkExt, StreamExt};
use renova_sync_core::{Record, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hub::RealtimeHub;
use storage::{TableStorage, TableStorageError};

// ============================================================================
// Configuration
// ============================================================================

/// API key entry in config
#[derive(Debug, Clone, Deserialize)]
struct ApiKeyEntry {
    key: String,
    name: String,
}

/// Config file structure
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// Directory holding one JSON file per collection
    data_dir: PathBuf,
    /// Path to config file
    config_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("RENOVA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = std::env::var("RENOVA_SERVER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("renova-server")
            });

        let config_path = std::env::var("RENOVA_SERVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("renova-server")
                    .join("config.yaml")
            });

        Self {
            port,
            data_dir,
            config_path,
        }
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Authenticated client, added to request extensions after auth
#[derive(Debug, Clone)]
struct ApiClient {
    name: String,
}

/// API key store - maps key -> client
#[derive(Debug, Clone, Default)]
struct ApiKeyStore {
    keys: HashMap<String, ApiClient>,
}

impl ApiKeyStore {
    fn from_entries(entries: Vec<ApiKeyEntry>) -> Self {
        let keys = entries
            .into_iter()
            .map(|entry| (entry.key, ApiClient { name: entry.name }))
            .collect();
        Self { keys }
    }

    /// Load API keys from config file
    fn load(config_path: &std::path::Path) -> Self {
        match std::fs::read_to_string(config_path) {
            Ok(contents) => match serde_yaml::from_str::<ConfigFile>(&contents) {
                Ok(config) => {
                    let store = Self::from_entries(config.api_keys);
                    tracing::info!("Loaded {} API key(s)", store.keys.len());
                    store
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}",
                    config_path.display(),
                    e
                );
                tracing::warn!("No API keys loaded - all authenticated requests will fail");
                Self::default()
            }
        }
    }

    /// Validate an API key and return the associated client
    fn validate(&self, key: &str) -> Option<ApiClient> {
        self.keys.get(key).cloned()
    }
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    api_keys: Arc<ApiKeyStore>,
    storage: Arc<TableStorage>,
    hub: Arc<RealtimeHub>,
}

/// Error response body
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn error_response(status: StatusCode, error: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error,
            message: message.into(),
        }),
    )
        .into_response()
}

/// `?key=` fallback for WebSocket clients that cannot set headers
#[derive(Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

/// Authentication middleware
async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    // Extract Authorization header
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(key) => key.to_string(),
            None => {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "invalid_auth",
                    "Authorization header must use Bearer scheme",
                );
            }
        },
        None => match Query::<KeyQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|q| q.0.key)
        {
            Some(key) => key,
            None => {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "missing_auth",
                    "Authorization header required",
                );
            }
        },
    };

    // Validate API key
    match state.api_keys.validate(&api_key) {
        Some(client) => {
            request.extensions_mut().insert(client);
            next.run(request).await
        }
        None => error_response(StatusCode::UNAUTHORIZED, "invalid_key", "Invalid API key"),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler error mapped onto an HTTP status
struct ApiError(TableStorageError);

impl From<TableStorageError> for ApiError {
    fn from(e: TableStorageError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.0 {
            TableStorageError::InvalidCollection(_) => {
                error_response(StatusCode::BAD_REQUEST, "invalid_collection", self.0.to_string())
            }
            TableStorageError::Io(_) => {
                tracing::error!("{}", self.0);
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    self.0.to_string(),
                )
            }
        }
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_records(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<Vec<Record>>, ApiError> {
    Ok(Json(state.storage.list(&collection).await?))
}

async fn upsert_records(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(collection): Path<String>,
    Json(records): Json<Vec<Record>>,
) -> Result<StatusCode, ApiError> {
    let messages = state.storage.upsert_many(&collection, records).await?;
    tracing::info!(
        "{} upserted {} record(s) into {}",
        client.name,
        messages.len(),
        collection
    );
    for message in messages {
        state.hub.broadcast(&collection, message).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_record(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let id = RecordId::from(id);
    if let Some(message) = state.storage.delete(&collection, &id).await? {
        tracing::info!("{} deleted {}/{}", client.name, collection, id);
        state.hub.broadcast(&collection, message).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Upgrades to a WebSocket that streams one collection's changes.
async fn realtime(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(collection): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = renova_sync_core::store::validate_collection(&collection) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_collection", e.to_string());
    }
    ws.on_upgrade(move |socket| stream_changes(socket, state, client, collection))
}

async fn stream_changes(
    socket: WebSocket,
    state: AppState,
    client: ApiClient,
    collection: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut changes = state.hub.subscribe(&collection).await;
    tracing::info!("{} subscribed to {}", client.name, collection);

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(message) => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("Failed to encode change: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "{} lagged {} change(s) on {}",
                        client.name,
                        skipped,
                        collection
                    );
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Clients only listen; pings are answered by axum
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::info!("{} unsubscribed from {}", client.name, collection);
}

// ============================================================================
// Main
// ============================================================================

fn build_app(state: AppState) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new().route("/health", get(health));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route(
            "/collections/{collection}/records",
            get(list_records).post(upsert_records),
        )
        .route("/collections/{collection}/records/{id}", delete(delete_record))
        .route("/realtime/{collection}", get(realtime))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "renova_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    // Ensure data directory exists
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        tracing::error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Config file: {}", config.config_path.display());

    let state = AppState {
        api_keys: Arc::new(ApiKeyStore::load(&config.config_path)),
        storage: Arc::new(TableStorage::new(&config.data_dir)),
        hub: Arc::new(RealtimeHub::new()),
    };
    let app = build_app(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
