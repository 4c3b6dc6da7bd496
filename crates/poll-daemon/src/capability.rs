//! Poll capabilities: how the active poller reaches the remote endpoint.
//!
//! - `WebSocketPoll` - one request/response exchange per poll over `ws://`/`wss://`
//! - `LocalPoll` - in-process fake that answers with a sequence number

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use poll_core::{PollError, PollRequest};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

/// Issues one poll request and resolves with the endpoint's answer.
#[async_trait]
pub trait PollCapability: Send + Sync {
    async fn poll(&self, endpoint: &str, request: &PollRequest) -> Result<Value, PollError>;
}

/// Sends the request as a JSON text frame and waits for one JSON reply.
#[derive(Debug, Clone)]
pub struct WebSocketPoll {
    /// Upper bound for connect + send + reply
    pub timeout: Duration,
}

impl Default for WebSocketPoll {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketPoll {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(endpoint: &str, request: &PollRequest) -> Result<Value, PollError> {
        let (mut ws, _) = connect_async(endpoint)
            .await
            .map_err(|e| PollError::Network(e.to_string()))?;

        let body = serde_json::to_string(request).map_err(|e| PollError::InvalidResponse(e.to_string()))?;
        ws.send(Message::Text(body))
            .await
            .map_err(|e| PollError::Network(e.to_string()))?;

        let reply = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break serde_json::from_str(&text),
                Some(Ok(Message::Binary(data))) => break serde_json::from_slice(&data),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(PollError::Network("connection closed before reply".into()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(PollError::Network(e.to_string())),
            }
        };

        let _ = ws.close(None).await;
        reply.map_err(|e| PollError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl PollCapability for WebSocketPoll {
    async fn poll(&self, endpoint: &str, request: &PollRequest) -> Result<Value, PollError> {
        debug!(endpoint, peer_count = request.peer_count, "Sending poll request");
        timeout(self.timeout, Self::exchange(endpoint, request))
            .await
            .map_err(|_| PollError::Timeout(self.timeout))?
    }
}

/// In-process endpoint for demos and tests.
///
/// Echoes the request back with a global sequence number, so every peer sharing
/// one `LocalPoll` can tell how many polls were served in total.
#[derive(Debug, Default)]
pub struct LocalPoll {
    served: AtomicU64,
    latency: Duration,
}

impl LocalPoll {
    pub fn new(latency: Duration) -> Self {
        Self {
            served: AtomicU64::new(0),
            latency,
        }
    }

    /// Number of polls answered so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollCapability for LocalPoll {
    async fn poll(&self, endpoint: &str, request: &PollRequest) -> Result<Value, PollError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let seq = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({
            "endpoint": endpoint,
            "seq": seq,
            "peerCount": request.peer_count,
            "timestamp": request.timestamp,
        }))
    }
}
