//! Websocket link used by the driver.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};
use url::Url;

use super::ABNORMAL_CLOSURE;
use crate::error::TransportError;

/// Close code reported when the peer closes without a status.
pub const NO_STATUS_RECEIVED: u16 = 1005;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Frame(String),
    Closed { code: u16, reason: String },
}

/// An open socket: commands go out through `outbound`, frames and the final
/// close arrive on `inbound`.
#[derive(Debug)]
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<SocketCommand>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str, protocols: &[String]) -> Result<SocketLink, TransportError>;
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WsConnector {
    #[must_use]
    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

/// Accepts only `ws://` and `wss://` endpoints.
pub fn validate_url(url: &str) -> Result<Url, TransportError> {
    let parsed = Url::parse(url).map_err(|error| TransportError::InvalidUrl(error.to_string()))?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(TransportError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            parsed.scheme()
        )));
    }
    Ok(parsed)
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str, protocols: &[String]) -> Result<SocketLink, TransportError> {
        let parsed = validate_url(url)?;
        let mut request = parsed
            .as_str()
            .into_client_request()
            .map_err(|error| TransportError::Handshake(error.to_string()))?;
        if !protocols.is_empty() {
            let value = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|error| TransportError::Handshake(error.to_string()))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (stream, _response) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                TransportError::Handshake(format!(
                    "connection timeout after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|error| TransportError::Handshake(error.to_string()))?;

        let (mut writer, mut reader) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SocketCommand>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                match command {
                    SocketCommand::Text(text) => {
                        if let Err(error) = writer.send(Message::Text(text.into())).await {
                            warn!(error = %error, "websocket write failed");
                            break;
                        }
                    }
                    SocketCommand::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(error) = writer.send(Message::Close(Some(frame))).await {
                            debug!(error = %error, "websocket close frame not delivered");
                        }
                        break;
                    }
                }
            }
        });

        let endpoint = parsed.to_string();
        tokio::spawn(async move {
            let closed = loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(SocketEvent::Frame(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if inbound_tx.send(SocketEvent::Frame(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => debug!(endpoint = %endpoint, "ignoring non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        debug!(endpoint = %endpoint, bytes = payload.len(), "received ping");
                    }
                    Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => SocketEvent::Closed {
                                code: u16::from(frame.code),
                                reason: frame.reason.to_string(),
                            },
                            None => SocketEvent::Closed {
                                code: NO_STATUS_RECEIVED,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Err(error)) => {
                        warn!(endpoint = %endpoint, error = %error, "websocket read failed");
                        break SocketEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: error.to_string(),
                        };
                    }
                    None => {
                        break SocketEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".to_string(),
                        };
                    }
                }
            };
            let _ = inbound_tx.send(closed);
        });

        Ok(SocketLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
