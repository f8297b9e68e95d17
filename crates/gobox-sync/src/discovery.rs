//! # Discovery Module
//!
//! LAN discovery of a storage node's direct-transfer port over UDP.
//!
//! ## Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Direct Discovery                                 │
//! │                                                                         │
//! │  ┌─────────────┐   "GOBOX_DIRECT" (broadcast)   ┌─────────────────┐     │
//! │  │   CLIENT    │ ═════════════════════════════▶ │  STORAGE NODE   │     │
//! │  │   probe()   │                                │  Responder      │     │
//! │  │             │ ◀───────────────────────────── │  (UDP 7701)     │     │
//! │  └─────────────┘  "GOBOX_DIRECT_PORT:<port>"    └─────────────────┘     │
//! │                                                                         │
//! │  The probe is always bounded: no valid answer before the deadline      │
//! │  means Unavailable, and the caller stays on the relay.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::shutdown::signalled;

// =============================================================================
// Constants
// =============================================================================

/// Default UDP discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 7701;

/// Probe payload.
pub const PROBE_MESSAGE: &[u8] = b"GOBOX_DIRECT";

/// Prefix of a responder's answer; the direct TCP port follows.
const REPLY_PREFIX: &str = "GOBOX_DIRECT_PORT:";

/// Answer sent for a probe.
pub fn reply_for(port: u16) -> String {
    format!("{}{}", REPLY_PREFIX, port)
}

/// Direct port announced by a reply, `None` if the datagram is not a reply.
pub fn parse_reply(data: &[u8]) -> Option<u16> {
    std::str::from_utf8(data)
        .ok()?
        .trim()
        .strip_prefix(REPLY_PREFIX)?
        .parse()
        .ok()
        .filter(|port| *port != 0)
}

// =============================================================================
// Responder (storage node)
// =============================================================================

/// Answers discovery probes until stopped.
pub struct DiscoveryResponder {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryResponder {
    /// Binds `bind` and answers every probe with `direct_port`.
    pub async fn start(bind: SocketAddr, direct_port: u16) -> SyncResult<Self> {
        let socket = UdpSocket::bind(bind).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind discovery socket on {}: {}", bind, e))
        })?;
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(addr = %local_addr, direct_port, "Discovery responder started");
        let task = tokio::spawn(Self::run(Arc::new(socket), direct_port, shutdown_rx));

        Ok(DiscoveryResponder {
            local_addr,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    async fn run(socket: Arc<UdpSocket>, direct_port: u16, mut shutdown_rx: watch::Receiver<bool>) {
        let reply = reply_for(direct_port);
        let mut buf = [0u8; 512];

        loop {
            tokio::select! {
                _ = signalled(&mut shutdown_rx) => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) if &buf[..len] == PROBE_MESSAGE => {
                        debug!(%from, "Discovery probe received");
                        if let Err(e) = socket.send_to(reply.as_bytes(), from).await {
                            warn!(%from, error = %e, "Failed to answer discovery probe");
                        }
                    }
                    Ok((len, from)) => debug!(%from, len, "Ignoring unknown datagram"),
                    Err(e) => warn!(error = %e, "Error receiving discovery datagram"),
                },
            }
        }
        info!("Discovery responder stopped");
    }

    /// Stops answering and releases the socket. Idempotent.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

// =============================================================================
// Probe (client)
// =============================================================================

/// Where a storage node accepts direct connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectEndpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl DirectEndpoint {
    pub fn base_url(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("https://{}:{}", ip, self.port),
            IpAddr::V6(ip) => format!("https://[{}]:{}", ip, self.port),
        }
    }
}

/// Default probe target: the limited broadcast address.
pub fn broadcast_target(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port))
}

/// Sends one probe to `target` and waits up to `limit` for a valid answer.
/// Invalid answers are ignored; none at all is `Unavailable`.
pub async fn probe(target: SocketAddr, limit: Duration) -> SyncResult<DirectEndpoint> {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| SyncError::Unavailable(format!("probe socket: {}", e)))?;
    socket
        .set_broadcast(true)
        .map_err(|e| SyncError::Unavailable(format!("probe broadcast: {}", e)))?;
    socket
        .send_to(PROBE_MESSAGE, target)
        .await
        .map_err(|e| SyncError::Unavailable(format!("probe send to {}: {}", target, e)))?;

    let deadline = Instant::now() + limit;
    let mut buf = [0u8; 512];
    loop {
        match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => match parse_reply(&buf[..len]) {
                Some(port) => {
                    debug!(%from, port, "Storage node answered discovery probe");
                    return Ok(DirectEndpoint { ip: from.ip(), port });
                }
                None => debug!(%from, "Ignoring invalid discovery reply"),
            },
            Ok(Err(e)) => debug!(error = %e, "Discovery receive failed"),
            Err(_) => {
                return Err(SyncError::Unavailable(format!(
                    "no discovery reply from {} within {} ms",
                    target,
                    limit.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn test_reply_format() {
        assert_eq!(reply_for(8443), "GOBOX_DIRECT_PORT:8443");
        assert_eq!(parse_reply(b"GOBOX_DIRECT_PORT:8443"), Some(8443));
        assert_eq!(parse_reply(b"GOBOX_DIRECT_PORT:0"), None);
        assert_eq!(parse_reply(b"GOBOX_DIRECT_PORT:x"), None);
        assert_eq!(parse_reply(b"HELLO"), None);
    }

    #[tokio::test]
    async fn test_probe_finds_responder() {
        let responder = DiscoveryResponder::start(loopback(0), 8443).await.unwrap();
        let found = probe(responder.local_addr(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(found.port, 8443);
        assert_eq!(found.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(found.base_url(), "https://127.0.0.1:8443");

        responder.stop().await;
        responder.stop().await;
        assert!(!responder.is_running());
    }

    #[tokio::test]
    async fn test_probe_without_responder_is_unavailable() {
        // Bound but silent.
        let silent = UdpSocket::bind(loopback(0)).await.unwrap();
        let started = std::time::Instant::now();
        let err = probe(silent.local_addr().unwrap(), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unavailable(_)));
        assert!(started.elapsed() >= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn test_invalid_replies_are_ignored_until_deadline() {
        let fake = UdpSocket::bind(loopback(0)).await.unwrap();
        let target = fake.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((_, from)) = fake.recv_from(&mut buf).await {
                let _ = fake.send_to(b"NOT_GOBOX", from).await;
            }
        });

        let err = probe(target, Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, SyncError::Unavailable(_)));
    }
}
