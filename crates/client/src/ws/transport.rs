//! STOMP-over-WebSocket transport using tokio-tungstenite.
//!
//! A [`Connector`] produces one [`TransportLink`] per successful handshake.
//! The link is a pair of channels: frames pushed into `outbound` are written to
//! the socket, and everything the socket yields arrives on `inbound`. Dropping
//! the outbound sender closes the socket.

use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use shopchat_shared::{Command, Frame, HeartBeat, HEADER_HEART_BEAT, HEADER_MESSAGE};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::{ConnectionConfig, ReconnectConfig};
use crate::error::ChatError;

/// Sending half of a live link.
pub type FrameSink = UnboundedSender<Frame>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything the socket reports after the handshake.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(Frame),
    /// The peer closed the socket or the stream ended.
    Closed(String),
    /// Read or write failure; the link is dead.
    Failed(ChatError),
}

/// One established broker session.
pub struct TransportLink {
    pub outbound: FrameSink,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens broker sessions. The connection manager holds one of these and calls
/// it for the initial connect and for every reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Resolve once the broker has answered CONNECT with CONNECTED.
    async fn connect(&self, config: &ConnectionConfig) -> Result<TransportLink, ChatError>;
}

/// Production connector: WebSocket upgrade, then STOMP CONNECT.
#[derive(Debug, Clone)]
pub struct StompConnector {
    connect_timeout: Duration,
    heart_beat: HeartBeat,
}

impl StompConnector {
    pub fn new(reconnect: &ReconnectConfig) -> Self {
        Self {
            connect_timeout: reconnect.connect_timeout,
            heart_beat: reconnect.heart_beat(),
        }
    }
}

#[async_trait]
impl Connector for StompConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<TransportLink, ChatError> {
        let url = config.ws_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChatError::InvalidConfig(format!("bad websocket request: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.credential))
            .map_err(|_| ChatError::InvalidConfig("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let host = config.host();
        let heart_beat = self.heart_beat;
        let handshake = async {
            let (ws_stream, _response) = connect_async(request)
                .await
                .map_err(|e| ChatError::Transport(e.to_string()))?;
            let (mut write, mut read) = ws_stream.split();

            let connect = Frame::connect(&host, &config.credential, heart_beat);
            write
                .send(Message::text(connect.encode()))
                .await
                .map_err(|e| ChatError::Transport(e.to_string()))?;

            let server_heart_beat = await_connected(&mut read).await?;
            Ok::<_, ChatError>((write, read, server_heart_beat))
        };

        let (write, read, server_heart_beat) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ChatError::Transport(format!(
                    "handshake with {} timed out after {:?}",
                    url, self.connect_timeout
                ))
            })??;

        crate::log_info!("STOMP session established with {}", url);

        let keepalive = heart_beat
            .negotiated_outgoing_ms(&server_heart_beat)
            .map(Duration::from_millis);

        let (outbound_tx, outbound_rx) = unbounded::<Frame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(read_loop(read, inbound_tx.clone()));
        tokio::spawn(write_loop(write, outbound_rx, keepalive, inbound_tx));

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Wait for CONNECTED and return the server's heart-beat offer.
async fn await_connected(read: &mut SplitStream<WsStream>) -> Result<HeartBeat, ChatError> {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let frames = Frame::decode_all(text.as_str())
                    .map_err(|e| ChatError::Protocol(e.to_string()))?;
                for frame in frames {
                    match frame.command {
                        Command::Connected => {
                            return Ok(frame
                                .get(HEADER_HEART_BEAT)
                                .and_then(HeartBeat::parse)
                                .unwrap_or_default());
                        }
                        Command::Error => {
                            let reason = frame.get(HEADER_MESSAGE).unwrap_or(frame.body.as_str());
                            return Err(ChatError::Protocol(reason.to_string()));
                        }
                        other => crate::log_debug!("Ignoring {} before CONNECTED", other),
                    }
                }
            }
            Ok(Message::Close(_)) => {
                return Err(ChatError::Transport(
                    "socket closed during STOMP handshake".to_string(),
                ))
            }
            Ok(_) => {}
            Err(e) => return Err(ChatError::Transport(e.to_string())),
        }
    }
    Err(ChatError::Transport("stream ended before CONNECTED".to_string()))
}

async fn read_loop(mut read: SplitStream<WsStream>, events: mpsc::UnboundedSender<TransportEvent>) {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match Frame::decode_all(text.as_str()) {
                Ok(frames) => {
                    for frame in frames {
                        crate::log_debug!("Received {} frame", frame.command);
                        if events.send(TransportEvent::Frame(frame)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => crate::log_warn!("Dropping undecodable STOMP frame: {}", e),
            },
            Ok(Message::Close(close)) => {
                let reason = match close {
                    Some(cf) => format!("closed by broker ({}): {}", u16::from(cf.code), cf.reason.as_str()),
                    None => "closed by broker".to_string(),
                };
                crate::log_info!("WebSocket {}", reason);
                let _ = events.send(TransportEvent::Closed(reason));
                return;
            }
            Ok(Message::Ping(data)) => {
                // Pong is handled automatically by tungstenite
                crate::log_debug!("Received ping: {:?}", data);
            }
            Ok(_) => {}
            Err(e) => {
                crate::log_error!("WebSocket read error: {}", e);
                let _ = events.send(TransportEvent::Failed(ChatError::Transport(e.to_string())));
                return;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed("stream ended".to_string()));
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut frames: UnboundedReceiver<Frame>,
    keepalive: Option<Duration>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut ticker = keepalive.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        // None = heart-beat due, Some(None) = sender dropped
        let next = match ticker.as_mut() {
            Some(ticker) => tokio::select! {
                frame = frames.next() => Some(frame),
                _ = ticker.tick() => None,
            },
            None => Some(frames.next().await),
        };

        let message = match next {
            None => Message::text("\n".to_string()),
            Some(Some(frame)) => {
                crate::log_debug!("Sending {} frame", frame.command);
                Message::text(frame.encode())
            }
            Some(None) => {
                crate::log_info!("Link released, closing WebSocket");
                let _ = write.send(Message::Close(None)).await;
                let _ = write.close().await;
                return;
            }
        };

        if let Err(e) = write.send(message).await {
            crate::log_error!("Send failed: {}", e);
            let _ = events.send(TransportEvent::Failed(ChatError::Transport(e.to_string())));
            return;
        }
    }
}
