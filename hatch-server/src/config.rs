//! Server configuration.

use clap::Parser;
use hatch_core::RelayConfig;
use std::time::Duration;

use crate::control::ControlSettings;
use crate::registry::PoolSettings;

/// Hatch Server - Expose services behind NAT through reverse tunnels.
#[derive(Parser, Debug, Clone)]
#[command(name = "hatch-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address every listener binds to
    #[arg(long, env = "HATCH_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port for client control connections
    #[arg(long, env = "HATCH_CONTROL_PORT", default_value = "8088")]
    pub control_port: u16,

    /// Port clients open tunnel sockets to
    #[arg(long, env = "HATCH_TUNNEL_PORT", default_value = "8089")]
    pub tunnel_port: u16,

    /// Port for public HTTP traffic
    #[arg(long, env = "HATCH_HTTP_PORT", default_value = "8087")]
    pub http_port: u16,

    /// Tunnel sockets kept warm per domain
    #[arg(long, env = "HATCH_POOL_SIZE", default_value = "5")]
    pub pool_size: usize,

    /// Public connections relayed concurrently
    #[arg(long, env = "HATCH_MAX_WORKERS", default_value = "128")]
    pub max_workers: usize,

    /// Maximum number of concurrent control connections
    #[arg(long, env = "HATCH_MAX_TUNNELS", default_value = "100")]
    pub max_tunnels: usize,

    /// Read timeout in seconds once a message has started
    #[arg(long, env = "HATCH_READ_TIMEOUT", default_value = "30")]
    pub read_timeout: u64,

    /// Idle keep-alive timeout in seconds between public requests
    #[arg(long, env = "HATCH_KEEP_ALIVE_TIMEOUT", default_value = "15")]
    pub keep_alive_timeout: u64,

    /// Seconds a new control connection has to send its HELLO
    #[arg(long, env = "HATCH_HANDSHAKE_TIMEOUT", default_value = "10")]
    pub handshake_timeout: u64,

    /// Seconds between heartbeats sent to clients
    #[arg(long, env = "HATCH_HEARTBEAT_INTERVAL", default_value = "10")]
    pub heartbeat_interval: u64,

    /// Seconds of silence after which a control connection is dropped
    #[arg(long, env = "HATCH_HEARTBEAT_TIMEOUT", default_value = "30")]
    pub heartbeat_timeout: u64,

    /// Seconds an ADD request may stay unanswered
    #[arg(long, env = "HATCH_PENDING_TIMEOUT", default_value = "30")]
    pub pending_timeout: u64,

    /// Maximum size of an HTTP head in bytes
    #[arg(long, env = "HATCH_MAX_HEADER_SIZE", default_value = "8192")]
    pub max_header_size: usize,

    /// Maximum size of a control frame in bytes
    #[arg(long, env = "HATCH_MAX_FRAME_SIZE", default_value = "65536")]
    pub max_frame_size: usize,

    /// Seconds in-flight connections get to finish on shutdown
    #[arg(long, env = "HATCH_SHUTDOWN_TIMEOUT", default_value = "30")]
    pub shutdown_timeout: u64,

    /// Enable debug logging
    #[arg(long, env = "HATCH_DEBUG")]
    pub debug: bool,
}

impl ServerConfig {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.bind, self.control_port)
    }

    pub fn tunnel_addr(&self) -> String {
        format!("{}:{}", self.bind, self.tunnel_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.bind, self.http_port)
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            read_timeout: Duration::from_secs(self.read_timeout),
            idle_timeout: Some(self.keep_alive_timeout()),
            max_header_size: self.max_header_size,
            ..RelayConfig::default()
        }
    }

    pub fn pool(&self) -> PoolSettings {
        PoolSettings {
            size: self.pool_size,
            pending_ttl: Duration::from_secs(self.pending_timeout),
        }
    }

    pub fn control(&self) -> ControlSettings {
        ControlSettings {
            handshake_timeout: self.handshake_timeout(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout),
            max_frame: self.max_frame_size,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::parse_from(["hatch-server"]);
        assert_eq!(config.http_port, 8087);
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.http_addr(), "0.0.0.0:8087");
        assert_eq!(config.relay().idle_timeout, Some(Duration::from_secs(15)));
        assert_eq!(config.pool().size, 5);
        assert_eq!(config.control().heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.control().max_frame, 65536);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::parse_from([
            "hatch-server",
            "--bind",
            "127.0.0.1",
            "--tunnel-port",
            "9000",
            "--pool-size",
            "2",
            "--debug",
        ]);
        assert_eq!(config.tunnel_addr(), "127.0.0.1:9000");
        assert_eq!(config.pool().size, 2);
        assert!(config.debug);
    }
}
