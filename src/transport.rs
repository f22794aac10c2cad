//! The message-oriented full-duplex channel to the remote model, behind a
//! `Connector` seam so session logic is testable without a network.

use crate::{config::Config, models::ConnectError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, warn};

/// Frames delivered by the channel reader.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One inbound text message.
    Message(String),
    /// The channel is gone; no further messages will arrive.
    Closed { reason: Option<String> },
}

/// An open channel: text messages out, `ChannelEvent`s in. Dropping the
/// outbound sender closes the underlying connection.
pub struct LiveChannel {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<ChannelEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<LiveChannel, ConnectError>;
}

/// Production connector over a websocket, with the API key carried as a
/// query parameter the way the remote endpoint expects.
pub struct WsConnector {
    endpoint: String,
    api_key: Option<String>,
}

impl WsConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            endpoint: config.live_endpoint.clone(),
            api_key: config.gemini_api_key.clone(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<LiveChannel, ConnectError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConnectError::Configuration("GEMINI_API_KEY is not set".into()))?;
        let url = format!("{}?key={}", self.endpoint, api_key);

        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        debug!("live websocket established");
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (in_tx, in_rx) = mpsc::channel::<ChannelEvent>(64);

        // Writer pump: forwards outbound text until the session drops its
        // sender, then closes the socket.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        // Reader pump: forwards inbound text and reports closure exactly once.
        tokio::spawn(async move {
            loop {
                let event = match ws_rx.next().await {
                    Some(Ok(WsMessage::Text(text))) => ChannelEvent::Message(text.to_string()),
                    Some(Ok(WsMessage::Close(frame))) => ChannelEvent::Closed {
                        reason: frame.map(|f| f.reason.to_string()),
                    },
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "live websocket read failed");
                        ChannelEvent::Closed {
                            reason: Some(e.to_string()),
                        }
                    }
                    None => ChannelEvent::Closed { reason: None },
                };
                let closed = matches!(event, ChannelEvent::Closed { .. });
                if in_tx.send(event).await.is_err() || closed {
                    break;
                }
            }
        });

        Ok(LiveChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
