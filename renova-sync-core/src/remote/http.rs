//! HTTP + WebSocket client for `renova-server`.
//!
//! Routes:
//! - `GET    /collections/{collection}/records`
//! - `POST   /collections/{collection}/records` (JSON array, upsert by id)
//! - `DELETE /collections/{collection}/records/{id}`
//! - `WS     /realtime/{collection}?key=...`

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{RemoteFeed, RemoteStore, FEED_BUFFER};
use crate::error::SyncError;
use crate::record::{Record, RecordId};

/// Timeout for individual REST calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Timeout for the reachability check.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Remote store reached over HTTP, with realtime pushes over WebSocket.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    server_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            client,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn records_url(&self, collection: &str) -> String {
        build_http_url(
            &self.server_url,
            &format!("/collections/{}/records", urlencoding::encode(collection)),
        )
    }

    fn record_url(&self, collection: &str, id: &RecordId) -> String {
        format!(
            "{}/{}",
            self.records_url(collection),
            urlencoding::encode(id.as_str())
        )
    }

    fn realtime_url(&self, collection: &str) -> String {
        format!(
            "{}/realtime/{}?key={}",
            ws_base(&self.server_url),
            urlencoding::encode(collection),
            urlencoding::encode(&self.api_key)
        )
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upsert_many(&self, collection: &str, records: &[Record]) -> Result<(), SyncError> {
        if records.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(self.records_url(collection))
            .header("Authorization", self.bearer())
            .json(records)
            .send()
            .await?;
        check_status(response).await?;

        tracing::debug!("Upserted {} record(s) into {}", records.len(), collection);
        Ok(())
    }

    async fn delete_one(&self, collection: &str, id: &RecordId) -> Result<(), SyncError> {
        let response = self
            .client
            .delete(self.record_url(collection, id))
            .header("Authorization", self.bearer())
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn select_all(&self, collection: &str) -> Result<Vec<Record>, SyncError> {
        let response = self
            .client
            .get(self.records_url(collection))
            .header("Authorization", self.bearer())
            .send()
            .await?;

        check_status(response)
            .await?
            .json::<Vec<Record>>()
            .await
            .map_err(|e| SyncError::MalformedMessage(format!("{}: {}", collection, e)))
    }

    async fn subscribe(&self, collection: &str) -> Result<RemoteFeed, SyncError> {
        let url = self.realtime_url(collection);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::TransportFailure(format!("realtime {}: {}", collection, e)))?;

        tracing::info!("Realtime channel open for {}", collection);

        let (mut sender, mut receiver) = ws_stream.split();
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let collection = collection.to_string();

        let pump = tokio::spawn(async move {
            while let Some(msg_result) = receiver.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            if tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => tracing::warn!("Dropping non-UTF-8 frame on {}", collection),
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Realtime channel for {} failed: {}", collection, e);
                        break;
                    }
                }
            }

            let _ = sender.send(Message::Close(None)).await;
            tracing::info!("Realtime channel closed for {}", collection);
        });

        Ok(RemoteFeed::new(rx, Some(pump)))
    }
}

/// Maps an HTTP status to the sync error taxonomy.
///
/// 4xx means the server refused the request (retrying will not help),
/// anything else non-2xx is treated as a transport problem.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("server returned {}: {}", status, body.trim());
    if status.is_client_error() {
        Err(SyncError::RemoteRejected(message))
    } else {
        Err(SyncError::TransportFailure(message))
    }
}

/// Returns true when the server answers `GET /health` in time.
pub async fn check_server(server_url: &str) -> bool {
    let client = match reqwest::Client::builder().timeout(HEALTH_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    match client.get(build_http_url(server_url, "/health")).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            tracing::debug!("Server {} unreachable: {}", server_url, e);
            false
        }
    }
}

/// Base URL with an `http(s)` scheme.
fn http_base(server_url: &str) -> String {
    // Convert ws(s) to http(s) if needed
    let base_url = if server_url.starts_with("ws://") {
        server_url.replacen("ws://", "http://", 1)
    } else if server_url.starts_with("wss://") {
        server_url.replacen("wss://", "https://", 1)
    } else if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
        format!("http://{}", server_url)
    } else {
        server_url.to_string()
    };

    base_url.trim_end_matches('/').to_string()
}

/// Base URL with a `ws(s)` scheme.
fn ws_base(server_url: &str) -> String {
    // Convert http(s) to ws(s) if needed
    let base_url = if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
        format!("ws://{}", server_url)
    } else {
        server_url.to_string()
    };

    base_url.trim_end_matches('/').to_string()
}

fn build_http_url(server_url: &str, path: &str) -> String {
    format!("{}{}", http_base(server_url), path)
}
