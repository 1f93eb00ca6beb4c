//! TCP reachability checks.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

/// Whether something accepts connections on a host/port.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_listening(&self, host: &str, port: u16) -> bool;
}

/// Probe that attempts a plain TCP connect with a per-attempt timeout.
#[derive(Debug, Clone, Copy)]
pub struct TcpPortProbe {
    timeout: Duration,
}

impl TcpPortProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_listening(&self, host: &str, port: u16) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                trace!(host, port, error = %e, "Port probe refused");
                false
            }
            Err(_) => {
                trace!(host, port, "Port probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpPortProbe::new(Duration::from_millis(500));
        assert!(probe.is_listening("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TcpPortProbe::new(Duration::from_millis(500));
        assert!(!probe.is_listening("127.0.0.1", port).await);
    }
}
