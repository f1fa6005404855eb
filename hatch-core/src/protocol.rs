//! Control protocol spoken between client and server.
//!
//! Messages travel as length-prefixed JSON records (see [`crate::codec`]).
//! Every record carries a `type` discriminant; decoding validates it once and
//! yields a strongly typed [`ControlMessage`].

use crate::error::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one requested tunnel socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(pub Uuid);

impl TunnelId {
    /// Generate a new random tunnel id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TunnelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a `HELLO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HelloStatus {
    Success,
    DomainOccupied,
}

/// Outcome of an `ADD` as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddStatus {
    Success,
    Error,
}

/// A control-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Client claims ownership of a domain.
    #[serde(rename = "HELLO")]
    Hello { host: String },
    /// Server answers a `HELLO`.
    #[serde(rename = "HELLO_ACK")]
    HelloAck { status: HelloStatus },
    /// Server asks for a new tunnel socket. Also the tag a fresh tunnel
    /// socket sends as its first frame.
    #[serde(rename = "ADD")]
    AddTunnelRequest { id: TunnelId },
    /// Client reports whether it managed to open the requested socket.
    #[serde(rename = "ADD_ACK")]
    AddTunnelAck { id: TunnelId, status: AddStatus },
    /// Heartbeat.
    #[serde(rename = "PING")]
    Ping,
}

impl ControlMessage {
    pub fn hello(host: impl Into<String>) -> Self {
        ControlMessage::Hello { host: host.into() }
    }

    pub fn hello_ack(status: HelloStatus) -> Self {
        ControlMessage::HelloAck { status }
    }

    pub fn add(id: TunnelId) -> Self {
        ControlMessage::AddTunnelRequest { id }
    }

    pub fn add_ack(id: TunnelId, status: AddStatus) -> Self {
        ControlMessage::AddTunnelAck { id, status }
    }

    /// Wire name of the message discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "HELLO",
            ControlMessage::HelloAck { .. } => "HELLO_ACK",
            ControlMessage::AddTunnelRequest { .. } => "ADD",
            ControlMessage::AddTunnelAck { .. } => "ADD_ACK",
            ControlMessage::Ping => "PING",
        }
    }
}

/// Which end of the control connection a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// State of a control session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    /// Client sent `HELLO` and waits for the answer.
    AwaitingHelloAck,
    /// Server waits for the client's `HELLO`.
    AwaitingHello,
    /// Server saw a `HELLO` and is checking the registry.
    Registering { domain: String },
    Registered { domain: String },
    Closed,
}

/// What the caller must do after feeding a message into the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Server: check-and-insert `domain` into the registry, then call
    /// [`ControlSession::registered`] or [`ControlSession::close`].
    Register { domain: String },
    /// Client: the server accepted the domain.
    Registered,
    /// Client: open, tag and serve a new tunnel socket.
    OpenTunnel(TunnelId),
    /// Server: client reported on a requested tunnel socket.
    TunnelAcked { id: TunnelId, ok: bool },
    /// Client: answer the server's heartbeat.
    ReplyPing,
    /// Server: heartbeat answer received.
    Heartbeat,
}

/// Socket-free control protocol state machine.
#[derive(Debug, Clone)]
pub struct ControlSession {
    role: Role,
    state: SessionState,
    domain: Option<String>,
}

impl ControlSession {
    /// Server session, waiting for the client's `HELLO`.
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            state: SessionState::AwaitingHello,
            domain: None,
        }
    }

    /// Client session for `domain`, not yet connected.
    pub fn client(domain: impl Into<String>) -> Self {
        Self {
            role: Role::Client,
            state: SessionState::Connecting,
            domain: Some(domain.into()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.state, SessionState::Registered { .. })
    }

    /// Domain this session is about, once known.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Client: build the `HELLO` and move to `AwaitingHelloAck`.
    pub fn hello(&mut self) -> TunnelResult<ControlMessage> {
        match (&self.state, self.role, &self.domain) {
            (SessionState::Connecting, Role::Client, Some(domain)) => {
                let msg = ControlMessage::hello(domain.clone());
                self.state = SessionState::AwaitingHelloAck;
                Ok(msg)
            }
            _ => Err(self.violation("HELLO can only be sent once by a connecting client")),
        }
    }

    /// Server: the registry accepted the domain.
    pub fn registered(&mut self) -> TunnelResult<()> {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Registering { domain } => {
                self.state = SessionState::Registered { domain };
                Ok(())
            }
            _ => Err(TunnelError::internal("registered() outside of Registering")),
        }
    }

    /// Force the session closed.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Feed one received message through the state machine.
    ///
    /// Any error leaves the session `Closed`.
    pub fn handle(&mut self, msg: &ControlMessage) -> TunnelResult<SessionAction> {
        let result = self.transition(msg);
        if result.is_err() {
            self.state = SessionState::Closed;
        }
        result
    }

    fn transition(&mut self, msg: &ControlMessage) -> TunnelResult<SessionAction> {
        match (self.role, &self.state, msg) {
            (Role::Server, SessionState::AwaitingHello, ControlMessage::Hello { host }) => {
                if host.trim().is_empty() {
                    return Err(TunnelError::protocol("HELLO with an empty host"));
                }
                let domain = host.trim().to_ascii_lowercase();
                self.domain = Some(domain.clone());
                self.state = SessionState::Registering {
                    domain: domain.clone(),
                };
                Ok(SessionAction::Register { domain })
            }
            (Role::Client, SessionState::AwaitingHelloAck, ControlMessage::HelloAck { status }) => {
                let domain = self.domain.clone().unwrap_or_default();
                match status {
                    HelloStatus::Success => {
                        self.state = SessionState::Registered { domain };
                        Ok(SessionAction::Registered)
                    }
                    HelloStatus::DomainOccupied => Err(TunnelError::domain_conflict(&domain)),
                }
            }
            (Role::Client, SessionState::Registered { .. }, ControlMessage::AddTunnelRequest { id }) => {
                Ok(SessionAction::OpenTunnel(*id))
            }
            (Role::Server, SessionState::Registered { .. }, ControlMessage::AddTunnelAck { id, status }) => {
                Ok(SessionAction::TunnelAcked {
                    id: *id,
                    ok: *status == AddStatus::Success,
                })
            }
            (Role::Client, SessionState::Registered { .. }, ControlMessage::Ping) => {
                Ok(SessionAction::ReplyPing)
            }
            (Role::Server, SessionState::Registered { .. }, ControlMessage::Ping) => {
                Ok(SessionAction::Heartbeat)
            }
            (_, state, msg) => Err(self
                .violation("unexpected control message")
                .with_context("message", msg.kind())
                .with_context("state", format!("{:?}", state))),
        }
    }

    fn violation(&self, message: &str) -> TunnelError {
        TunnelError::protocol(message.to_string()).with_context(
            "role",
            match self.role {
                Role::Client => "client",
                Role::Server => "server",
            },
        )
    }
}
