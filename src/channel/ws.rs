// WebSocket transport for the realtime channel
// Pumps frames between a tokio-tungstenite socket and the channel's link.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::{self, ClientEvent, Frame, Framing, ServerEvent};
use super::{Connector, Link};
use crate::api::Token;
use crate::error::{ChatError, ChatResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct WsConnector {
    url: String,
    framing: Framing,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, framing: Framing) -> Self {
        WsConnector {
            url: url.into(),
            framing,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Upper bound for the WebSocket upgrade plus, for Socket.IO, the namespace connect.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    async fn handshake(&self, token: &Token) -> ChatResult<Socket> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChatError::TransportDrop(format!("invalid realtime url {}: {}", self.url, e)))?;
        let bearer = HeaderValue::from_str(&token.bearer())
            .map_err(|_| ChatError::Auth("token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let mut socket = match tokio_tungstenite::connect_async(request).await {
            Ok((socket, _response)) => socket,
            Err(WsError::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN =>
            {
                return Err(ChatError::Auth(format!("realtime handshake rejected: {}", response.status())));
            }
            Err(e) => return Err(ChatError::TransportDrop(format!("connect to {} failed: {}", self.url, e))),
        };
        if self.framing == Framing::SocketIo {
            socketio_connect(&mut socket, token).await?;
        }
        Ok(socket)
    }
}

/// Wait for the Engine.IO open packet, then join the default namespace with `token`.
async fn socketio_connect(socket: &mut Socket, token: &Token) -> ChatResult<()> {
    let mut sent_connect = false;
    while let Some(message) = socket.next().await {
        let text = match message {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(frame)) => {
                return Err(ChatError::TransportDrop(format!("closed during handshake: {:?}", frame)));
            }
            Ok(_) => continue,
            Err(e) => return Err(ChatError::TransportDrop(format!("handshake read failed: {}", e))),
        };
        match Framing::SocketIo.decode(&text)? {
            Frame::Open if !sent_connect => {
                socket
                    .send(WsMessage::Text(protocol::socketio_connect(token.as_str())))
                    .await
                    .map_err(|e| ChatError::TransportDrop(format!("handshake write failed: {}", e)))?;
                sent_connect = true;
            }
            Frame::Ping => {
                socket
                    .send(WsMessage::Text(protocol::SOCKETIO_PONG.to_string()))
                    .await
                    .map_err(|e| ChatError::TransportDrop(format!("handshake write failed: {}", e)))?;
            }
            Frame::Accepted => return Ok(()),
            Frame::Refused(reason) => return Err(ChatError::Auth(reason)),
            Frame::Closed => return Err(ChatError::TransportDrop("server closed during handshake".to_string())),
            other => debug!("Ignoring {:?} during Socket.IO handshake", other),
        }
    }
    Err(ChatError::TransportDrop("socket ended during handshake".to_string()))
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &Token) -> ChatResult<Link> {
        let socket = match timeout(self.handshake_timeout, self.handshake(token)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ChatError::TransportDrop(format!(
                    "handshake with {} timed out after {:?}",
                    self.url, self.handshake_timeout
                )))
            }
        };
        info!("Realtime socket connected to {} ({} framing)", self.url, self.framing);

        let (sink, stream) = socket.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();
        tokio::spawn(pump(self.framing, sink, stream, out_rx, in_tx));

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn pump(
    framing: Framing,
    mut sink: SplitSink<Socket, WsMessage>,
    mut stream: SplitStream<Socket>,
    mut out_rx: mpsc::UnboundedReceiver<ClientEvent>,
    in_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(event) => {
                    let text = match framing.encode(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode realtime event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        warn!("Realtime write failed: {}", e);
                        break;
                    }
                }
                None => {
                    // Channel side hung up
                    if let Err(e) = sink.close().await {
                        debug!("Error closing realtime socket: {}", e);
                    }
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => match framing.decode(&text) {
                    Ok(Frame::Event(event)) => {
                        if in_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Ping) => {
                        if let Err(e) = sink.send(WsMessage::Text(protocol::SOCKETIO_PONG.to_string())).await {
                            warn!("Realtime pong failed: {}", e);
                            break;
                        }
                    }
                    Ok(Frame::Closed) => {
                        info!("Realtime session closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Dropping malformed realtime frame: {}", e),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    info!("Realtime socket closed by server: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Realtime read failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    debug!("Realtime socket pump finished");
}
