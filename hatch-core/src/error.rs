//! Error types with rich context for the relay.
//!
//! Every failure the relay can observe maps to an [`ErrorCategory`]. The
//! category decides how far an error propagates (one socket, one session,
//! one domain) and which status a synthesized HTTP response carries.

use std::fmt;

/// Error categories for the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or oversized control frame. Fatal for the connection.
    Framing,
    /// Hello for a domain that is already owned. Fatal for the session.
    DomainConflict,
    /// Tunnel socket tagged with an id nobody is waiting for.
    UnknownTunnelId,
    /// No pooled tunnel socket for the requested host.
    NoBackendAvailable,
    /// Request or response head that cannot be parsed or framed.
    MalformedHttpHead,
    /// The upstream side closed or failed mid-relay.
    UpstreamClosed,
    /// The downstream side closed or failed mid-relay.
    DownstreamClosed,
    /// Control connection stopped answering heartbeats.
    HeartbeatTimeout,
    /// A read or handshake did not finish in time.
    Timeout,
    /// Connection setup failures.
    Connection,
    /// Control message that is valid on the wire but illegal in the current state.
    Protocol,
    /// Internal invariant failures.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Framing => write!(f, "framing"),
            ErrorCategory::DomainConflict => write!(f, "domain_conflict"),
            ErrorCategory::UnknownTunnelId => write!(f, "unknown_tunnel_id"),
            ErrorCategory::NoBackendAvailable => write!(f, "no_backend"),
            ErrorCategory::MalformedHttpHead => write!(f, "malformed_http_head"),
            ErrorCategory::UpstreamClosed => write!(f, "upstream_closed"),
            ErrorCategory::DownstreamClosed => write!(f, "downstream_closed"),
            ErrorCategory::HeartbeatTimeout => write!(f, "heartbeat_timeout"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Connection => write!(f, "connection"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// A tunnel error with category and context.
#[derive(Debug)]
pub struct TunnelError {
    /// The error category.
    pub category: ErrorCategory,
    /// A human-readable message.
    pub message: String,
    /// The underlying cause, if any.
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Additional context as key-value pairs.
    pub context: Vec<(String, String)>,
}

impl TunnelError {
    /// Create a new tunnel error.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            cause: None,
            context: Vec::new(),
        }
    }

    /// Add an underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Add context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Whether the error ends the whole control session rather than one socket.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Framing
                | ErrorCategory::DomainConflict
                | ErrorCategory::HeartbeatTimeout
                | ErrorCategory::Protocol
        )
    }

    /// Get the HTTP status code a synthesized response should carry.
    pub fn http_status(&self) -> u16 {
        match self.category {
            ErrorCategory::MalformedHttpHead => 400,
            ErrorCategory::NoBackendAvailable => 404,
            ErrorCategory::Timeout | ErrorCategory::HeartbeatTimeout => 504,
            ErrorCategory::UpstreamClosed | ErrorCategory::Connection => 502,
            _ => 500,
        }
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)?;

        if !self.context.is_empty() {
            write!(f, " (")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            write!(f, ")")?;
        }

        if let Some(ref cause) = self.cause {
            write!(f, ": {}", cause)?;
        }

        Ok(())
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// Convenience constructors
impl TunnelError {
    pub fn framing(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Framing, message)
    }

    pub fn domain_conflict(domain: &str) -> Self {
        Self::new(
            ErrorCategory::DomainConflict,
            format!("domain '{}' is already registered by another client", domain),
        )
    }

    pub fn unknown_tunnel_id(id: impl fmt::Display) -> Self {
        Self::new(ErrorCategory::UnknownTunnelId, "no pending request for tunnel id")
            .with_context("id", id.to_string())
    }

    pub fn no_backend(host: &str) -> Self {
        Self::new(
            ErrorCategory::NoBackendAvailable,
            format!("no backend registered for host '{}'", host),
        )
    }

    pub fn malformed_head(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::MalformedHttpHead, message)
    }

    pub fn upstream_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::UpstreamClosed, message)
    }

    pub fn downstream_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::DownstreamClosed, message)
    }

    pub fn heartbeat_timeout(elapsed: std::time::Duration) -> Self {
        Self::new(ErrorCategory::HeartbeatTimeout, "peer stopped answering heartbeats")
            .with_context("silent_for", format!("{:?}", elapsed))
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Protocol, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }
}

/// Result type using TunnelError.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Helper trait for adding context to errors.
pub trait ResultExt<T> {
    /// Convert the error into a [`TunnelError`] of the given category.
    fn with_category(self, category: ErrorCategory) -> Result<T, TunnelError>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for Result<T, E> {
    fn with_category(self, category: ErrorCategory) -> Result<T, TunnelError> {
        self.map_err(|e| TunnelError::new(category, e.to_string()).with_cause(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::unknown_tunnel_id("abc123").with_context("peer", "1.2.3.4:5000");

        let display = err.to_string();
        assert!(display.contains("[unknown_tunnel_id]"));
        assert!(display.contains("id=abc123"));
        assert!(display.contains("peer=1.2.3.4:5000"));
    }

    #[test]
    fn test_session_fatal() {
        assert!(TunnelError::framing("bad frame").is_session_fatal());
        assert!(TunnelError::domain_conflict("a.example.com").is_session_fatal());
        assert!(!TunnelError::upstream_closed("eof").is_session_fatal());
        assert!(!TunnelError::no_backend("a.example.com").is_session_fatal());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(TunnelError::malformed_head("test").http_status(), 400);
        assert_eq!(TunnelError::no_backend("x").http_status(), 404);
        assert_eq!(TunnelError::upstream_closed("test").http_status(), 502);
        assert_eq!(TunnelError::timeout("test").http_status(), 504);
    }

    #[test]
    fn test_with_category_keeps_cause() {
        let io: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        let err = io.with_category(ErrorCategory::UpstreamClosed).unwrap_err();
        assert_eq!(err.category, ErrorCategory::UpstreamClosed);
        assert!(std::error::Error::source(&err).is_some());
    }
}
