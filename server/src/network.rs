//! Server network layer: WebSocket transport and the relay loop
//!
//! Every accepted connection runs in its own task. Those tasks never touch
//! session state; they forward what they see to the relay loop as
//! [`ServerMessage`]s over one channel, and write whatever the loop queues on
//! their [`PeerHandle`] back to the socket. The loop in [`Server::run`] is the
//! only owner of [`SessionState`], so join, move, shot and disconnect
//! handling is strictly sequential.

use crate::config::RelaySettings;
use crate::connections::PeerChannel;
use crate::session::SessionState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{
    ClientEvent, CodecError, ParticipantId, RoomId, ServerEvent, WireCodec, CODEC_PARAM,
    ROOM_ID_PARAM, USER_ID_PARAM,
};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type ConnectionId = u64;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("relay loop is no longer running")]
    RelayClosed,
}

/// Why a handshake did not yield a usable participant.
#[derive(Debug, Error)]
pub enum ConnectRejection {
    #[error("user_id is required")]
    MissingUserId,
    #[error("room_id is required")]
    MissingRoomId,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Parameters carried in the handshake query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub user_id: ParticipantId,
    pub room_id: RoomId,
    pub codec: WireCodec,
}

impl ConnectParams {
    pub fn from_query(query: Option<&str>) -> Result<Self, ConnectRejection> {
        let mut user_id = None;
        let mut room_id = None;
        let mut codec = WireCodec::default();

        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match &*key {
                USER_ID_PARAM => user_id = Some(value.into_owned()),
                ROOM_ID_PARAM => room_id = Some(value.into_owned()),
                CODEC_PARAM => codec = value.parse()?,
                _ => {}
            }
        }

        let user_id = user_id
            .filter(|id| !id.is_empty())
            .ok_or(ConnectRejection::MissingUserId)?;
        let room_id = room_id
            .filter(|id| !id.is_empty())
            .ok_or(ConnectRejection::MissingRoomId)?;

        Ok(Self {
            user_id,
            room_id,
            codec,
        })
    }
}

/// The relay loop's end of one connection.
#[derive(Debug)]
pub struct PeerHandle {
    connection_id: ConnectionId,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl PeerHandle {
    pub fn new(connection_id: ConnectionId, sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

impl PeerChannel for PeerHandle {
    fn deliver(&self, event: ServerEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Messages sent from connection tasks to the relay loop
#[derive(Debug)]
pub enum ServerMessage {
    Connected {
        connection_id: ConnectionId,
        params: ConnectParams,
        addr: SocketAddr,
        handle: PeerHandle,
    },
    EventReceived {
        connection_id: ConnectionId,
        user_id: ParticipantId,
        event: ClientEvent,
    },
    Disconnected {
        connection_id: ConnectionId,
        user_id: ParticipantId,
    },
    Shutdown,
}

/// Cloneable control handle for a running relay.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    /// Asks the relay loop to stop. Returns false if it already stopped.
    pub fn shutdown(&self) -> bool {
        self.server_tx.send(ServerMessage::Shutdown).is_ok()
    }
}

/// Encodes an outgoing event with the codec negotiated at handshake.
pub fn encode_frame(codec: WireCodec, event: &ServerEvent) -> Result<Message, CodecError> {
    match codec {
        WireCodec::Json => Ok(Message::text(serde_json::to_string(event)?)),
        WireCodec::Bincode => Ok(Message::binary(codec.encode(event)?)),
    }
}

/// Decodes a client frame: text frames are JSON, binary frames are bincode.
/// Control frames yield `None`.
pub fn decode_frame(message: &Message) -> Option<Result<ClientEvent, CodecError>> {
    match message {
        Message::Text(text) => Some(WireCodec::Json.decode(text.as_str().as_bytes())),
        Message::Binary(data) => Some(WireCodec::Bincode.decode(data)),
        _ => None,
    }
}

/// Relay server coordinating the transport and session state
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    state: SessionState<PeerHandle>,
    settings: RelaySettings,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn bind(addr: &str, settings: RelaySettings) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on ws://{}", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener: Some(listener),
            local_addr,
            state: SessionState::new(settings.move_speed, settings.reap_empty_rooms),
            settings,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            server_tx: self.server_tx.clone(),
        }
    }

    pub fn state(&self) -> &SessionState<PeerHandle> {
        &self.state
    }

    /// Spawns the task that accepts connections and starts one task each
    fn spawn_acceptor(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut next_connection_id: ConnectionId = 1;

            loop {
                tokio::select! {
                    _ = server_tx.closed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let connection_id = next_connection_id;
                            next_connection_id += 1;
                            debug!("TCP connection {} from {}", connection_id, addr);

                            let server_tx = server_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, addr, connection_id, server_tx).await
                                {
                                    error!(
                                        "Connection {} from {} failed: {}",
                                        connection_id, addr, e
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                }
            }
        });
    }

    fn is_current(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        self.state
            .connections()
            .lookup(user_id)
            .map(PeerHandle::connection_id)
            == Some(connection_id)
    }

    /// Applies one transport event to the session state
    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Connected {
                connection_id,
                params,
                addr,
                handle,
            } => match self.state.connect(&params.user_id, &params.room_id, handle) {
                Ok(report) => {
                    if report.superseded {
                        warn!(
                            "Participant {} reconnected; previous connection closed",
                            params.user_id
                        );
                    }
                    info!(
                        "Connection {} from {} is participant {} in room {} ({} codec)",
                        connection_id, addr, params.user_id, params.room_id, params.codec
                    );
                }
                Err(e) => {
                    warn!("Connection {} from {} rejected: {}", connection_id, addr, e);
                }
            },

            ServerMessage::EventReceived {
                connection_id,
                user_id,
                event,
            } => {
                if !self.is_current(&user_id, connection_id) {
                    debug!(
                        "Dropping event from superseded connection {} ({})",
                        connection_id, user_id
                    );
                    return;
                }

                let relayed = match event {
                    ClientEvent::Move(record) => self.state.handle_move(&user_id, record),
                    ClientEvent::Shot => self.state.handle_shot(&user_id),
                };
                if relayed.is_none() {
                    debug!("Dropping event from {}: not in a room", user_id);
                }
            }

            ServerMessage::Disconnected {
                connection_id,
                user_id,
            } => {
                if !self.is_current(&user_id, connection_id) {
                    debug!(
                        "Ignoring disconnect of superseded connection {} ({})",
                        connection_id, user_id
                    );
                    return;
                }

                let fanout = self.state.disconnect(&user_id);
                info!(
                    "Participant {} disconnected, {} members notified",
                    user_id, fanout.delivered
                );
            }

            ServerMessage::Shutdown => {}
        }
    }

    fn log_status(&self) {
        let stats = self.state.stats();
        if stats.connections > 0 {
            debug!(
                "Status: {} connections, {} rooms, {} participants in rooms",
                stats.connections, stats.rooms, stats.participants_in_rooms
            );
        }
    }

    /// Main relay loop
    pub async fn run(mut self) -> Result<(), NetworkError> {
        self.spawn_acceptor();

        let mut status_timer =
            interval(self.settings.status_interval.max(Duration::from_millis(1)));
        // The first tick fires immediately
        status_timer.tick().await;

        info!(
            "Relay started (move speed {}, reap empty rooms: {})",
            self.settings.move_speed, self.settings.reap_empty_rooms
        );

        loop {
            tokio::select! {
                message = self.server_rx.recv() => match message {
                    Some(ServerMessage::Shutdown) | None => {
                        info!("Server shutting down");
                        break;
                    }
                    Some(message) => self.handle_message(message),
                },
                _ = status_timer.tick() => self.log_status(),
            }
        }

        Ok(())
    }
}

/// Runs one WebSocket connection from handshake to close
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    connection_id: ConnectionId,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) -> Result<(), NetworkError> {
    let mut query: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            query = request.uri().query().map(str::to_owned);
            Ok(response)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let params = match ConnectParams::from_query(query.as_deref()) {
        Ok(params) => params,
        Err(rejection) => {
            warn!(
                "Closing connection {} from {}: {}",
                connection_id, addr, rejection
            );
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: rejection.to_string().into(),
            };
            ws_sender.send(Message::Close(Some(frame))).await?;
            return Ok(());
        }
    };

    let user_id = params.user_id.clone();
    let codec = params.codec;
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    server_tx
        .send(ServerMessage::Connected {
            connection_id,
            params,
            addr,
            handle: PeerHandle::new(connection_id, event_tx),
        })
        .map_err(|_| NetworkError::RelayClosed)?;

    let result = pump(
        &mut ws_sender,
        &mut ws_receiver,
        &mut event_rx,
        &server_tx,
        connection_id,
        &user_id,
        codec,
    )
    .await;

    // Always report the end of the connection, even after a transport error.
    let _ = server_tx.send(ServerMessage::Disconnected {
        connection_id,
        user_id,
    });
    result
}

/// Moves events between the socket and the relay loop until either side
/// closes
async fn pump(
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    event_rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    server_tx: &mpsc::UnboundedSender<ServerMessage>,
    connection_id: ConnectionId,
    user_id: &str,
    codec: WireCodec,
) -> Result<(), NetworkError> {
    loop {
        tokio::select! {
            outgoing = event_rx.recv() => match outgoing {
                Some(event) => {
                    ws_sender.send(encode_frame(codec, &event)?).await?;
                }
                None => {
                    // The relay dropped our handle: superseded or rejected.
                    debug!("Connection {} ({}) closed by relay", connection_id, user_id);
                    ws_sender.send(Message::Close(None)).await?;
                    return Ok(());
                }
            },

            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(message)) => match decode_frame(&message) {
                    Some(Ok(event)) => {
                        server_tx
                            .send(ServerMessage::EventReceived {
                                connection_id,
                                user_id: user_id.to_string(),
                                event,
                            })
                            .map_err(|_| NetworkError::RelayClosed)?;
                    }
                    Some(Err(e)) => {
                        warn!("Dropping undecodable frame from {}: {}", user_id, e);
                    }
                    None => {}
                },
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}
