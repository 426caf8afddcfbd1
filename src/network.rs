/// Network layer for peer coordination.
///
/// This module provides the low-level primitives for server-to-server
/// communication:
///
/// - Protocol message types
/// - Newline-delimited JSON framing
/// - TCP connection and listener wrappers
///
/// # Protocol Design
///
/// Every coordination exchange uses its own short-lived TCP connection. A
/// record is one flat JSON object terminated by `\n`, discriminated by its
/// `type` field. Values are strings except for the list and map fields of
/// `view` and `globals`.
use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Maximum size of a single record (1 MB).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// String value of a granted reservation.
pub const APPROVED: &str = "true";
/// String value of a denied reservation.
pub const DENIED: &str = "false";
/// `approved` marker on an availability check relayed to the leader.
pub const FORWARDED: &str = "forwarded";

/// Protocol messages exchanged on the coordination port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    // ─────────────────────────────────────────────────────────────────────
    // Election
    // ─────────────────────────────────────────────────────────────────────
    /// Sent to every higher-priority neighbour to open a round.
    Election,

    /// Reply to `election`.
    Answer,

    /// The proposer nominates the recipient as leader.
    Nomination {
        #[serde(rename = "serverid")]
        server_id: String,
    },

    /// Announces the agreed leader.
    Coordinator { leader: String },

    // ─────────────────────────────────────────────────────────────────────
    // Liveness & Recovery
    // ─────────────────────────────────────────────────────────────────────
    /// Liveness probe.
    Heartbeat {
        #[serde(rename = "serverid")]
        server_id: String,
    },

    /// Liveness reply.
    HeartbeatResponse {
        #[serde(rename = "serverid")]
        server_id: String,
    },

    /// Recovery: announce that the sender is alive again.
    IamUp {
        #[serde(rename = "serverid")]
        server_id: String,
    },

    /// Recovery: the responder's current view.
    View { views: Vec<String> },

    /// Global registry snapshot. The request carries neither field.
    Globals {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clients: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chatrooms: Option<HashMap<String, String>>,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Global Registry
    // ─────────────────────────────────────────────────────────────────────
    /// Identity reservation protocol (see [`Message::reservation_step`]).
    NewIdentity {
        identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approved: Option<String>,
        #[serde(
            rename = "serverid",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        server_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created: Option<String>,
    },

    /// Room reservation protocol; `serverid` names the owning server.
    CreateRoom {
        #[serde(rename = "roomid")]
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approved: Option<String>,
        #[serde(
            rename = "serverid",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        server_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created: Option<String>,
    },

    /// Room ownership lookup; the reply fills in `serverid`.
    JoinRoom {
        #[serde(rename = "roomid")]
        room_id: String,
        #[serde(
            rename = "serverid",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        server_id: Option<String>,
    },

    /// Remove a room from every global mirror.
    DeleteRoom {
        #[serde(rename = "roomid")]
        room_id: String,
        #[serde(rename = "serverid")]
        server_id: String,
    },

    /// Remove a client identity from every global mirror.
    Quit {
        identity: String,
        #[serde(rename = "serverid")]
        server_id: String,
    },
}

/// Which step of the reservation protocol a `newidentity`/`createroom`
/// record represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationStep {
    /// Availability check relayed to the leader by `server_id`.
    Forwarded { server_id: String },
    /// Leader verdict on a forwarded check.
    Verdict { approved: bool },
    /// The requester created the object; promote the reservation.
    Created,
    /// Leader propagation of an approved creation to every mirror.
    Propagated { owner: Option<String> },
    /// None of the above.
    Unknown,
}

impl Message {
    /// Availability check for `identity`, relayed to the leader.
    pub fn identity_check(identity: &str, server_id: &str) -> Self {
        Message::NewIdentity {
            identity: identity.to_string(),
            approved: Some(FORWARDED.to_string()),
            server_id: Some(server_id.to_string()),
            created: None,
        }
    }

    /// Leader verdict for an identity availability check.
    pub fn identity_verdict(identity: &str, approved: bool, server_id: &str) -> Self {
        Message::NewIdentity {
            identity: identity.to_string(),
            approved: Some(verdict(approved).to_string()),
            server_id: Some(server_id.to_string()),
            created: None,
        }
    }

    /// Confirmation that `identity` was created on the requester.
    pub fn identity_created(identity: &str) -> Self {
        Message::NewIdentity {
            identity: identity.to_string(),
            approved: None,
            server_id: None,
            created: Some(APPROVED.to_string()),
        }
    }

    /// Propagation of an approved identity to every mirror.
    pub fn identity_approved(identity: &str) -> Self {
        Message::NewIdentity {
            identity: identity.to_string(),
            approved: Some(APPROVED.to_string()),
            server_id: None,
            created: None,
        }
    }

    /// Availability check for `room_id`, relayed to the leader.
    pub fn room_check(room_id: &str, server_id: &str) -> Self {
        Message::CreateRoom {
            room_id: room_id.to_string(),
            approved: Some(FORWARDED.to_string()),
            server_id: Some(server_id.to_string()),
            created: None,
        }
    }

    /// Leader verdict for a room availability check.
    pub fn room_verdict(room_id: &str, approved: bool, server_id: &str) -> Self {
        Message::CreateRoom {
            room_id: room_id.to_string(),
            approved: Some(verdict(approved).to_string()),
            server_id: Some(server_id.to_string()),
            created: None,
        }
    }

    /// Confirmation that `room_id` was created on `server_id`.
    ///
    /// The owner rides along so a leader that lost the pending entry in a
    /// failover can still record who owns the room.
    pub fn room_created(room_id: &str, server_id: &str) -> Self {
        Message::CreateRoom {
            room_id: room_id.to_string(),
            approved: None,
            server_id: Some(server_id.to_string()),
            created: Some(APPROVED.to_string()),
        }
    }

    /// Propagation of an approved room, with its owner, to every mirror.
    pub fn room_approved(room_id: &str, owner: &str) -> Self {
        Message::CreateRoom {
            room_id: room_id.to_string(),
            approved: Some(APPROVED.to_string()),
            server_id: Some(owner.to_string()),
            created: None,
        }
    }

    /// Empty `globals` request.
    pub fn globals_request() -> Self {
        Message::Globals {
            clients: None,
            chatrooms: None,
        }
    }

    /// Classify a reservation record. Returns `Unknown` for other types.
    ///
    /// A `created=true` field wins over `approved`; `approved=true` without a
    /// `serverid` is an identity propagation, with one it is either a verdict
    /// (identity) or a room propagation carrying the owner.
    pub fn reservation_step(&self) -> ReservationStep {
        let (approved, server_id, created, is_room) = match self {
            Message::NewIdentity {
                approved,
                server_id,
                created,
                ..
            } => (approved, server_id, created, false),
            Message::CreateRoom {
                approved,
                server_id,
                created,
                ..
            } => (approved, server_id, created, true),
            _ => return ReservationStep::Unknown,
        };

        if created.as_deref() == Some(APPROVED) {
            return ReservationStep::Created;
        }

        match (approved.as_deref(), server_id) {
            (Some(FORWARDED), Some(server_id)) => ReservationStep::Forwarded {
                server_id: server_id.clone(),
            },
            (Some(APPROVED), owner) if is_room => ReservationStep::Propagated {
                owner: owner.clone(),
            },
            (Some(APPROVED), None) => ReservationStep::Propagated { owner: None },
            (Some(APPROVED), Some(_)) => ReservationStep::Verdict { approved: true },
            (Some(DENIED), _) => ReservationStep::Verdict { approved: false },
            _ => ReservationStep::Unknown,
        }
    }

    /// The `type` tag of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Election => "election",
            Message::Answer => "answer",
            Message::Nomination { .. } => "nomination",
            Message::Coordinator { .. } => "coordinator",
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatResponse { .. } => "heartbeatresponse",
            Message::IamUp { .. } => "iamup",
            Message::View { .. } => "view",
            Message::Globals { .. } => "globals",
            Message::NewIdentity { .. } => "newidentity",
            Message::CreateRoom { .. } => "createroom",
            Message::JoinRoom { .. } => "joinroom",
            Message::DeleteRoom { .. } => "deleteroom",
            Message::Quit { .. } => "quit",
        }
    }

    /// Serialize to one newline-terminated record.
    pub fn to_line(&self) -> MeshResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize from one record (trailing whitespace allowed).
    pub fn from_line(line: &str) -> MeshResult<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

fn verdict(approved: bool) -> &'static str {
    if approved { APPROVED } else { DENIED }
}

/// Connection to a peer carrying newline-delimited records.
pub struct Connection {
    stream: BufReader<TcpStream>,
    peer_addr: String,
}

impl Connection {
    /// Wrap an established TCP stream.
    pub fn new(stream: TcpStream, peer_addr: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            peer_addr: peer_addr.into(),
        }
    }

    /// Connect to a peer, giving up after `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> MeshResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MeshError::Timeout {
                addr: addr.to_string(),
                operation: "connect",
            })?
            .map_err(|e| MeshError::Connection {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self::new(stream, addr))
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Send one record.
    pub async fn send(&mut self, message: &Message) -> MeshResult<()> {
        let bytes = message.to_line()?;

        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(MeshError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let result = {
            let stream = self.stream.get_mut();
            match stream.write_all(&bytes).await {
                Ok(()) => stream.flush().await,
                Err(e) => Err(e),
            }
        };
        result.map_err(|e| self.connection_error(e))
    }

    /// Receive one record, waiting as long as the peer takes.
    pub async fn receive(&mut self) -> MeshResult<Message> {
        let mut line = String::new();
        let result = {
            let mut limited = (&mut self.stream).take(MAX_MESSAGE_SIZE as u64 + 1);
            limited.read_line(&mut line).await
        };
        let read = result.map_err(|e| self.connection_error(e))?;

        if read == 0 {
            return Err(MeshError::ConnectionClosed);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(MeshError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        Message::from_line(&line)
    }

    /// Receive one record, failing with [`MeshError::Timeout`] after `timeout`.
    pub async fn receive_timeout(
        &mut self,
        timeout: Duration,
        operation: &'static str,
    ) -> MeshResult<Message> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::Timeout {
                addr: self.peer_addr.clone(),
                operation,
            }),
        }
    }

    /// Send a record and wait up to `timeout` for the reply.
    pub async fn request(
        &mut self,
        message: &Message,
        timeout: Duration,
        operation: &'static str,
    ) -> MeshResult<Message> {
        self.send(message).await?;
        self.receive_timeout(timeout, operation).await
    }

    fn connection_error(&self, e: std::io::Error) -> MeshError {
        MeshError::Connection {
            addr: self.peer_addr.clone(),
            reason: e.to_string(),
        }
    }
}

/// TCP listener for incoming coordination connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to an address and start listening.
    pub async fn bind(addr: &str) -> MeshResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::from_tokio(listener)
    }

    /// Adopt an already bound listener (used when the port was chosen by the OS).
    pub fn from_tokio(listener: TcpListener) -> MeshResult<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> MeshResult<Connection> {
        let (stream, peer_addr) = self.listener.accept().await?;
        Ok(Connection::new(stream, peer_addr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let line = Message::Nomination {
            server_id: "s2".to_string(),
        }
        .to_line()
        .unwrap();
        let text = String::from_utf8(line).unwrap();
        assert!(text.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "nomination");
        assert_eq!(value["serverid"], "s2");
    }

    #[test]
    fn test_parse_foreign_records() {
        let msg = Message::from_line(r#"{"type":"heartbeatresponse","serverid":"s1"}"#).unwrap();
        assert_eq!(
            msg,
            Message::HeartbeatResponse {
                server_id: "s1".to_string()
            }
        );

        let msg = Message::from_line(r#"{"type":"globals"}"#).unwrap();
        assert_eq!(msg, Message::globals_request());

        let msg = Message::from_line(r#"{"type":"joinroom","roomid":"jokes"}"#).unwrap();
        assert_eq!(
            msg,
            Message::JoinRoom {
                room_id: "jokes".to_string(),
                server_id: None
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = Message::from_line(r#"{"type":"dance"}"#).unwrap_err();
        assert!(matches!(err, MeshError::Serialization(_)));
    }

    #[test]
    fn test_globals_request_omits_fields() {
        let text = String::from_utf8(Message::globals_request().to_line().unwrap()).unwrap();
        assert_eq!(text, "{\"type\":\"globals\"}\n");
    }

    #[test]
    fn test_reservation_steps() {
        assert_eq!(
            Message::identity_check("alice", "s1").reservation_step(),
            ReservationStep::Forwarded {
                server_id: "s1".to_string()
            }
        );
        assert_eq!(
            Message::identity_verdict("alice", true, "s1").reservation_step(),
            ReservationStep::Verdict { approved: true }
        );
        assert_eq!(
            Message::identity_verdict("alice", false, "s1").reservation_step(),
            ReservationStep::Verdict { approved: false }
        );
        assert_eq!(
            Message::identity_created("alice").reservation_step(),
            ReservationStep::Created
        );
        assert_eq!(
            Message::identity_approved("alice").reservation_step(),
            ReservationStep::Propagated { owner: None }
        );
        assert_eq!(
            Message::room_approved("jokes", "s2").reservation_step(),
            ReservationStep::Propagated {
                owner: Some("s2".to_string())
            }
        );
        assert_eq!(
            Message::room_created("jokes", "s2").reservation_step(),
            ReservationStep::Created
        );
        assert_eq!(Message::Answer.reservation_step(), ReservationStep::Unknown);
    }

    #[tokio::test]
    async fn test_listener_and_connection() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().to_string();

        let accept_handle = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let msg = conn.receive().await.unwrap();
            conn.send(&Message::HeartbeatResponse {
                server_id: "s2".to_string(),
            })
            .await
            .unwrap();
            msg
        });

        let mut client = Connection::connect(&listen_addr, Duration::from_secs(1))
            .await
            .unwrap();
        let response = client
            .request(
                &Message::Heartbeat {
                    server_id: "s1".to_string(),
                },
                Duration::from_secs(1),
                "heartbeat",
            )
            .await
            .unwrap();

        assert_eq!(
            response,
            Message::HeartbeatResponse {
                server_id: "s2".to_string()
            }
        );
        assert_eq!(
            accept_handle.await.unwrap(),
            Message::Heartbeat {
                server_id: "s1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().to_string();

        // Accept but never answer.
        let hold = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(conn);
        });

        let mut client = Connection::connect(&listen_addr, Duration::from_secs(1))
            .await
            .unwrap();
        let err = client
            .receive_timeout(Duration::from_millis(50), "answer")
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Timeout { operation: "answer", .. }));

        hold.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().to_string();

        let closer = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            drop(conn);
        });

        let mut client = Connection::connect(&listen_addr, Duration::from_secs(1))
            .await
            .unwrap();
        closer.await.unwrap();
        let err = client.receive().await.unwrap_err();
        assert!(err.is_peer_failure());
    }
}
