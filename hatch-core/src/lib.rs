//! Core types and protocols for the hatch reverse tunnel.
//!
//! This crate provides the functionality shared by the tunnel server and
//! client: the control wire protocol, the control session state machine,
//! HTTP head parsing and the relay engine that streams request/response
//! cycles between two connections.

pub mod chunked;
pub mod codec;
pub mod error;
pub mod http;
pub mod protocol;
pub mod relay;

pub use codec::{CodecError, FrameReader, DEFAULT_MAX_FRAME};
pub use error::{ErrorCategory, ResultExt, TunnelError, TunnelResult};
pub use http::{BodyFraming, MessageHead};
pub use protocol::{AddStatus, ControlMessage, ControlSession, HelloStatus, SessionAction, TunnelId};
pub use relay::{Backend, RelayConfig, RelayEngine};
