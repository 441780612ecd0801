//! Transport seam between the supervisor and the network.
//!
//! A [`Transport`] opens [`TransportLink`]s: a sink of outbound text frames
//! and a stream of inbound text frames that ends when the connection
//! closes. [`WsTransport`] is the production implementation over
//! `tokio-tungstenite`; tests plug in in-memory transports.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::TransportError;

/// Outbound half of a live connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a live connection. Ends (`None`) when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An established connection, split into its two halves.
pub struct TransportLink {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Something that can open connections to the telemetry endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the handshake and return a live link.
    async fn open(&self) -> Result<TransportLink, TransportError>;

    /// Human-readable endpoint, used in log fields.
    fn endpoint(&self) -> &str;
}

/// WebSocket transport to the telemetry server.
///
/// A per-process `client_id` (UUID v4) is appended as a query parameter so
/// the server can correlate reconnects of the same client.
pub struct WsTransport {
    ws_url: String,
    client_id: String,
}

impl WsTransport {
    /// * `ws_url` - WebSocket endpoint, e.g. `wss://host/ws/telemetry`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn connect_url(&self) -> String {
        let sep = if self.ws_url.contains('?') { '&' } else { '?' };
        format!("{}{}clientId={}", self.ws_url, sep, self.client_id)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        let (ws_stream, _response) = connect_async(self.connect_url()).await.map_err(|e| {
            TransportError::Connect(format!(
                "Failed to connect to telemetry server at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %self.client_id,
            "Connected to telemetry server at {}",
            self.ws_url,
        );

        let (sink, stream) = ws_stream.split();

        let sink = sink
            .sink_map_err(|e: tungstenite::Error| TransportError::Send(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));

        let stream = stream
            .take_while(|frame| {
                let open = !matches!(frame, Ok(Message::Close(_)));
                if !open {
                    tracing::info!("Telemetry server closed WebSocket");
                }
                future::ready(open)
            })
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(_)) => {
                        tracing::trace!("Ignoring binary frame");
                        None
                    }
                    // Ping / pong are answered by tungstenite.
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
                })
            });

        Ok(TransportLink {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn endpoint(&self) -> &str {
        &self.ws_url
    }
}
