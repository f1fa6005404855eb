//! Upstream reachability check.
//!
//! Run once before the tunnel comes up, so a missing local service is
//! reported at start-up rather than as 502s on the public side.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{error, info};

/// Verify the local service accepts TCP connections. Returns the connect
/// latency.
pub async fn verify_upstream(addr: &str, limit: Duration) -> Result<Duration, String> {
    info!("Verifying upstream connectivity to {}...", addr);

    let start = Instant::now();
    let result = match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(format!("Connection failed: {}", e)),
        Err(_) => Err("Connection timeout".to_string()),
    };

    match &result {
        Ok(latency) => info!("Upstream {} is reachable (latency: {:?})", addr, latency),
        Err(e) => error!("Upstream {} is not reachable: {}", addr, e),
    }
    result
}
