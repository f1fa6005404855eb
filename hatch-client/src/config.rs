//! Client configuration.

use clap::Parser;
use hatch_core::RelayConfig;
use std::time::Duration;

use crate::local::LocalPoolConfig;

/// Hatch Client - Expose a local HTTP service through a hatch server.
#[derive(Parser, Debug, Clone)]
#[command(name = "hatch-client")]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Hatch server host
    #[arg(short, long, env = "HATCH_SERVER", default_value = "localhost")]
    pub server: String,

    /// Server port for the control connection
    #[arg(long, env = "HATCH_CONTROL_PORT", default_value = "8088")]
    pub control_port: u16,

    /// Server port tunnel sockets are opened to
    #[arg(long, env = "HATCH_TUNNEL_PORT", default_value = "8089")]
    pub tunnel_port: u16,

    /// Public domain to claim on the server
    #[arg(short, long, env = "HATCH_DOMAIN")]
    pub domain: String,

    /// Local host to forward to
    #[arg(short = 'H', long, env = "HATCH_LOCAL_HOST", default_value = "127.0.0.1")]
    pub local_host: String,

    /// Local port to expose
    #[arg(short = 'p', long, env = "HATCH_LOCAL_PORT")]
    pub local_port: u16,

    /// Connect timeout in seconds, for the server and the local service
    #[arg(long, env = "HATCH_CONNECT_TIMEOUT", default_value = "5")]
    pub connect_timeout: u64,

    /// Read timeout in seconds once a message has started
    #[arg(long, env = "HATCH_READ_TIMEOUT", default_value = "30")]
    pub read_timeout: u64,

    /// Seconds an idle local connection is kept for reuse
    #[arg(long, env = "HATCH_KEEP_ALIVE_TIMEOUT", default_value = "60")]
    pub keep_alive_timeout: u64,

    /// Seconds without any frame from the server before reconnecting
    #[arg(long, env = "HATCH_HEARTBEAT_TIMEOUT", default_value = "30")]
    pub heartbeat_timeout: u64,

    /// Maximum size of an HTTP head in bytes
    #[arg(long, env = "HATCH_MAX_HEADER_SIZE", default_value = "8192")]
    pub max_header_size: usize,

    /// Maximum size of a control frame in bytes
    #[arg(long, env = "HATCH_MAX_FRAME_SIZE", default_value = "65536")]
    pub max_frame_size: usize,

    /// Reconnect delay in seconds
    #[arg(long, env = "HATCH_RECONNECT_DELAY", default_value = "5")]
    pub reconnect_delay: u64,

    /// Maximum reconnect attempts (0 = infinite)
    #[arg(long, env = "HATCH_MAX_RECONNECTS", default_value = "0")]
    pub max_reconnects: u32,

    /// Verify upstream connectivity before establishing the tunnel
    #[arg(long, env = "HATCH_VERIFY_UPSTREAM", default_value = "true", action = clap::ArgAction::Set)]
    pub verify_upstream: bool,

    /// Require upstream to be reachable (exit if not)
    #[arg(long, env = "HATCH_REQUIRE_UPSTREAM")]
    pub require_upstream: bool,

    /// Enable debug logging
    #[arg(long, env = "HATCH_DEBUG")]
    pub debug: bool,
}

impl ClientConfig {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.server, self.control_port)
    }

    pub fn tunnel_addr(&self) -> String {
        format!("{}:{}", self.server, self.tunnel_port)
    }

    /// Address of the local service traffic is forwarded to.
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }

    /// Tunnel sockets sit in the server's pool for as long as it likes, so
    /// the wait for their first request is unbounded.
    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            read_timeout: Duration::from_secs(self.read_timeout),
            idle_timeout: None,
            max_header_size: self.max_header_size,
            ..RelayConfig::default()
        }
    }

    pub fn local_pool(&self) -> LocalPoolConfig {
        LocalPoolConfig {
            addr: self.local_addr(),
            connect_timeout: self.connect_timeout(),
            idle_timeout: Duration::from_secs(self.keep_alive_timeout),
            ..LocalPoolConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ClientConfig {
        let mut argv = vec!["hatch-client", "--domain", "a.example.com", "--local-port", "3000"];
        argv.extend_from_slice(args);
        ClientConfig::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.control_addr(), "localhost:8088");
        assert_eq!(config.tunnel_addr(), "localhost:8089");
        assert_eq!(config.local_addr(), "127.0.0.1:3000");
        assert!(config.verify_upstream);
        assert!(!config.require_upstream);
        assert_eq!(config.relay().idle_timeout, None);
        assert_eq!(config.local_pool().idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--server",
            "tunnel.example.com",
            "--control-port",
            "9000",
            "--verify-upstream",
            "false",
            "--local-host",
            "10.0.0.2",
        ]);
        assert_eq!(config.control_addr(), "tunnel.example.com:9000");
        assert_eq!(config.local_addr(), "10.0.0.2:3000");
        assert!(!config.verify_upstream);
    }

    #[test]
    fn test_domain_is_required() {
        assert!(ClientConfig::try_parse_from(["hatch-client", "--local-port", "3000"]).is_err());
    }
}
