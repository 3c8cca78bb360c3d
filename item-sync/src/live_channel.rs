//! Push channel for out-of-band item changes.
//!
//! One WebSocket connection per session. The client authorizes with
//! `{"type":"authorization","payload":{"token":..}}`; the server then pushes
//! `created`, `updated` and `deleted` messages whose payload is the item.
//! Every message is applied to the local store before it is forwarded as an
//! [`ItemEvent`].

use crate::error::{SyncError, SyncResult};
use crate::model::Item;
use crate::store::ItemStore;
use crate::subscription::Subscription;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wire format of the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum PushMessage {
    Authorization { token: String },
    Created(Item),
    Updated(Item),
    Deleted(Item),
}

/// Change applied from the push channel, for the in-memory collection
#[derive(Debug, Clone, PartialEq)]
pub enum ItemEvent {
    Upserted(Item),
    Removed(String),
}

enum SessionEnd {
    /// Server sent a close frame.
    Closed,
    /// Consumer went away or the subscription was canceled.
    Stopped,
    /// Socket failed or ended without a close frame.
    Dropped(String),
}

#[derive(Clone)]
pub struct LiveUpdateChannel {
    url: String,
    max_retries: u32,
    backoff: Duration,
    store: ItemStore,
}

impl LiveUpdateChannel {
    pub fn new(url: impl Into<String>, max_retries: u32, backoff: Duration, store: ItemStore) -> Self {
        Self {
            url: url.into(),
            max_retries,
            backoff,
            store,
        }
    }

    /// Apply one inbound text frame to the store.
    ///
    /// Malformed messages are logged and ignored; only storage failures are errors.
    pub async fn apply_message(&self, text: &str) -> SyncResult<Option<ItemEvent>> {
        let message: PushMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed push message");
                return Ok(None);
            }
        };

        match message {
            PushMessage::Created(item) | PushMessage::Updated(item) => {
                if item.id.is_none() {
                    tracing::warn!("Dropping push message for an item without id");
                    return Ok(None);
                }
                self.store.put_item(&item).await?;
                tracing::debug!(item_id = ?item.id, version = item.version, "Applied pushed item");
                Ok(Some(ItemEvent::Upserted(item)))
            }
            PushMessage::Deleted(item) => {
                let Some(id) = item.id else {
                    tracing::warn!("Dropping delete notification without id");
                    return Ok(None);
                };
                self.store.remove_item(&id).await?;
                tracing::debug!(item_id = %id, "Applied pushed delete");
                Ok(Some(ItemEvent::Removed(id)))
            }
            PushMessage::Authorization { .. } => {
                tracing::debug!("Ignoring authorization message from server");
                Ok(None)
            }
        }
    }

    /// Open the channel in a background task. Events go to `events` until the
    /// returned subscription is canceled or the receiver is dropped.
    pub fn open(&self, token: String, events: mpsc::UnboundedSender<ItemEvent>) -> Subscription {
        let canceled = Subscription::flag();
        let channel = self.clone();
        let flag = canceled.clone();
        let handle = tokio::spawn(async move {
            channel.run(token, events, flag).await;
        });
        Subscription::new(canceled, vec![handle])
    }

    async fn run(self, token: String, events: mpsc::UnboundedSender<ItemEvent>, canceled: Arc<AtomicBool>) {
        let mut failures: u32 = 0;

        loop {
            if canceled.load(Ordering::SeqCst) || events.is_closed() {
                return;
            }

            let end = match self.connect(&token).await {
                Ok(ws) => {
                    failures = 0;
                    self.session(ws, &events, &canceled).await
                }
                Err(e) => SessionEnd::Dropped(e.to_string()),
            };

            match end {
                SessionEnd::Stopped => return,
                SessionEnd::Closed => {
                    tracing::info!(url = %self.url, "Push channel closed by server");
                    return;
                }
                SessionEnd::Dropped(reason) => {
                    failures += 1;
                    if failures > self.max_retries {
                        tracing::error!(
                            url = %self.url,
                            attempts = failures,
                            reason = %reason,
                            "Push channel gave up reconnecting"
                        );
                        return;
                    }
                    let delay = self.retry_delay(failures);
                    tracing::warn!(
                        url = %self.url,
                        attempt = failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason = %reason,
                        "Push channel dropped, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Backoff for the given consecutive failure, doubling from the base delay.
    fn retry_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exponent)
    }

    async fn connect(&self, token: &str) -> SyncResult<WsStream> {
        let (mut ws, _) = connect_async(self.url.as_str()).await?;
        let hello = serde_json::to_string(&PushMessage::Authorization {
            token: token.to_string(),
        })?;
        ws.send(Message::Text(hello)).await?;
        tracing::info!(url = %self.url, "Push channel connected");
        Ok(ws)
    }

    async fn session(
        &self,
        mut ws: WsStream,
        events: &mpsc::UnboundedSender<ItemEvent>,
        canceled: &AtomicBool,
    ) -> SessionEnd {
        while let Some(frame) = ws.next().await {
            if canceled.load(Ordering::SeqCst) {
                return SessionEnd::Stopped;
            }

            match frame {
                Ok(Message::Text(text)) => {
                    let event = match self.apply_message(&text).await {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to apply push message");
                            continue;
                        }
                    };
                    let Some(event) = event else { continue };
                    if canceled.load(Ordering::SeqCst) || events.send(event).is_err() {
                        return SessionEnd::Stopped;
                    }
                }
                // tungstenite queues the pong itself and flushes it on the next read.
                Ok(Message::Ping(_)) => tracing::debug!("Push channel ping"),
                Ok(Message::Close(_)) => return SessionEnd::Closed,
                Ok(_) => {}
                Err(e) => return SessionEnd::Dropped(SyncError::from(e).to_string()),
            }
        }
        SessionEnd::Dropped("stream ended".to_string())
    }
}
