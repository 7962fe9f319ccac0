//! Push-event subscriptions for long-running generation jobs.
//!
//! A subscription only moves raw frames. Reconnecting after a dropped
//! connection happens here; interpreting frames is left to the consumer.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{Stream, StreamExt};
use shared::domain::PublicId;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, info, warn};

use crate::transport::AuthProvider;

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Frame(String),
    /// The connection failed or dropped. The source keeps reconnecting.
    TransportError(String),
}

/// Owned handle on one live push stream. Dropping it stops the pump and
/// closes the underlying connection.
pub struct EventSubscription {
    messages: ReceiverStream<StreamMessage>,
    pump: Option<JoinHandle<()>>,
}

impl EventSubscription {
    pub fn new(messages: mpsc::Receiver<StreamMessage>, pump: Option<JoinHandle<()>>) -> Self {
        Self {
            messages: ReceiverStream::new(messages),
            pump,
        }
    }

    pub fn close(self) {}
}

impl Stream for EventSubscription {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.messages).poll_next(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.messages.close();
    }
}

pub trait GenerationEventSource: Send + Sync {
    fn subscribe(&self, public_id: &PublicId) -> EventSubscription;
}

pub struct WsEventSource {
    base_url: String,
    reconnect_delay: Duration,
    auth: Arc<dyn AuthProvider>,
}

impl WsEventSource {
    pub fn new(
        base_url: impl Into<String>,
        reconnect_delay: Duration,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            reconnect_delay,
            auth,
        }
    }
}

impl GenerationEventSource for WsEventSource {
    fn subscribe(&self, public_id: &PublicId) -> EventSubscription {
        let url = format!("{}/sessions/{public_id}/events", self.base_url);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pump = tokio::spawn(pump_frames(
            url,
            self.reconnect_delay,
            Arc::clone(&self.auth),
            tx,
        ));
        EventSubscription::new(rx, Some(pump))
    }
}

async fn pump_frames(
    url: String,
    reconnect_delay: Duration,
    auth: Arc<dyn AuthProvider>,
    tx: mpsc::Sender<StreamMessage>,
) {
    loop {
        let interruption = match open_stream(&url, auth.as_ref()).await {
            Ok(mut stream) => {
                info!(%url, "events: stream connected");
                let mut reason = "event stream closed by server".to_string();
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            if tx.send(StreamMessage::Frame(text)).await.is_err() {
                                return;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            reason = format!("websocket receive failed: {err}");
                            break;
                        }
                    }
                }
                reason
            }
            Err(err) => format!("failed to connect event stream {url}: {err:#}"),
        };

        warn!(%url, "events: {interruption}; reconnecting");
        if tx
            .send(StreamMessage::TransportError(interruption))
            .await
            .is_err()
        {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = tx.closed() => {
                debug!(%url, "events: subscriber gone, stopping");
                return;
            }
        }
    }
}

async fn open_stream(
    url: &str,
    auth: &dyn AuthProvider,
) -> anyhow::Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
> {
    let mut request = url.into_client_request()?;
    if let Some(token) = auth.access_token().await {
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
    }
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

#[cfg(test)]
#[path = "tests/events_tests.rs"]
mod tests;
