//! # Direct Transfer Client
//!
//! ```text
//! RelayAuthority
//!     │ upload / download
//!     ▼
//! DirectLink ── cool-down after a failed negotiation ──► Unavailable
//!     │ first use
//!     ▼
//! DirectNegotiator: probe ─► directCredential (relay) ─► pinned TLS ─► login
//!     │
//!     ▼
//! DirectChannel: GET /file, POST /upload with the session token
//! ```
//!
//! Every failure that says "the direct path is not usable right now"
//! surfaces as [`SyncError::Unavailable`]; callers then use the relay.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::SecondsFormat;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RANGE};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gobox_core::{ErrorKind, FileNode, Mutation, NodeId};

use super::preview::Preview;
use super::tls::pinned_client_config;
use super::{LoginReply, LoginRequest, FILE_PATH, LOGIN_PATH, UPLOAD_PATH};
use crate::connector::RelayLink;
use crate::discovery::{probe, DirectEndpoint};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{channels, decode_response, DirectGrant};

/// Probe wait used when none is configured.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-request deadline on the direct channel.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a failed negotiation suppresses new attempts.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

fn unreachable_err(e: reqwest::Error) -> SyncError {
    SyncError::Unavailable(format!("direct request failed: {}", e))
}

fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Unauthorized,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::CONFLICT => ErrorKind::Conflict,
        StatusCode::UNPROCESSABLE_ENTITY => ErrorKind::InvalidState,
        StatusCode::SERVICE_UNAVAILABLE => ErrorKind::Unavailable,
        s if s.is_client_error() => ErrorKind::InvalidRequest,
        _ => ErrorKind::Internal,
    }
}

/// Passes successful responses through; turns the rest into the remote's
/// error, message kept verbatim.
async fn check(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    match decode_response(body) {
        Err(err) => Err(err),
        Ok(_) => Err(SyncError::remote(
            kind_for_status(status),
            format!("direct request failed with HTTP {}", status),
        )),
    }
}

// =============================================================================
// Channel
// =============================================================================

/// An authenticated HTTPS session with one storage node.
#[derive(Debug)]
pub struct DirectChannel {
    http: Client,
    base_url: String,
    token: String,
}

impl DirectChannel {
    /// Redeems `credential` at `base_url` and keeps the session token.
    pub async fn login(http: Client, base_url: String, credential: String) -> SyncResult<Self> {
        let request = LoginRequest {
            temporary_credential: credential,
            cookie: false,
        };
        let response = http
            .post(format!("{}{}", base_url, LOGIN_PATH))
            .json(&request)
            .send()
            .await
            .map_err(unreachable_err)?;
        let reply: LoginReply = check(response)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::InvalidMessage(format!("login reply: {}", e)))?;

        match reply.token {
            Some(token) if reply.success => Ok(DirectChannel {
                http,
                base_url,
                token,
            }),
            _ => Err(SyncError::Unauthorized(
                "login succeeded without a session token".to_string(),
            )),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn get_file(&self, id: NodeId, preview: bool, range: Option<String>) -> SyncResult<reqwest::Response> {
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, FILE_PATH))
            .header(AUTHORIZATION, self.bearer())
            .query(&[("ID", id.to_string()), ("preview", preview.to_string())]);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        check(request.send().await.map_err(unreachable_err)?).await
    }

    /// Whole file content, or a zip archive for a directory.
    pub async fn download(&self, id: NodeId) -> SyncResult<Vec<u8>> {
        let response = self.get_file(id, false, None).await?;
        let bytes = response.bytes().await.map_err(unreachable_err)?;
        debug!(id, bytes = bytes.len(), "Direct download");
        Ok(bytes.to_vec())
    }

    /// Inclusive byte range; `end` of `None` reads to the end of the file.
    pub async fn download_range(&self, id: NodeId, start: u64, end: Option<u64>) -> SyncResult<Vec<u8>> {
        let range = match end {
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        };
        let response = self.get_file(id, false, Some(range)).await?;
        let bytes = response.bytes().await.map_err(unreachable_err)?;
        Ok(bytes.to_vec())
    }

    pub async fn preview(&self, id: NodeId) -> SyncResult<Preview> {
        let response = self.get_file(id, true, None).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response.bytes().await.map_err(unreachable_err)?;
        Ok(Preview {
            content_type,
            body: body.to_vec(),
        })
    }

    /// Sends a file create or update with its content.
    pub async fn upload(&self, mutation: &Mutation) -> SyncResult<FileNode> {
        let (query, content) = match mutation {
            Mutation::Create {
                parent_id,
                name,
                is_directory: false,
                modified_at,
                content: Some(content),
            } => (
                vec![
                    ("parentId", parent_id.to_string()),
                    ("name", name.clone()),
                    ("modifiedAt", modified_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
                ],
                content,
            ),
            Mutation::Update {
                id,
                modified_at,
                content: Some(content),
            } => (
                vec![
                    ("ID", id.to_string()),
                    ("modifiedAt", modified_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
                ],
                content,
            ),
            _ => {
                return Err(SyncError::Unavailable(
                    "direct upload only carries file content".to_string(),
                ))
            }
        };

        let response = self
            .http
            .post(format!("{}{}", self.base_url, UPLOAD_PATH))
            .header(AUTHORIZATION, self.bearer())
            .query(&query)
            .body(content.clone())
            .send()
            .await
            .map_err(unreachable_err)?;
        check(response)
            .await?
            .json::<FileNode>()
            .await
            .map_err(|e| SyncError::InvalidMessage(format!("upload reply: {}", e)))
    }
}

// =============================================================================
// Negotiation
// =============================================================================

/// Opens [`DirectChannel`]s: discovery probe, credential over the relay,
/// pinned TLS, login.
pub struct DirectNegotiator {
    relay: RelayLink,
    probe_target: SocketAddr,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl DirectNegotiator {
    pub fn new(relay: RelayLink, probe_target: SocketAddr) -> Self {
        DirectNegotiator {
            relay,
            probe_target,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, limit: Duration) -> Self {
        self.probe_timeout = limit;
        self
    }

    pub fn with_request_timeout(mut self, limit: Duration) -> Self {
        self.request_timeout = limit;
        self
    }

    pub async fn negotiate(&self) -> SyncResult<DirectChannel> {
        let found = probe(self.probe_target, self.probe_timeout).await?;

        let transport = self
            .relay
            .current()
            .map_err(|e| SyncError::Unavailable(e.to_string()))?;
        let grant: DirectGrant = transport
            .request(channels::DIRECT_CREDENTIAL, json!({}))
            .await?;

        // The probe tells us which address answers on this network; the
        // grant is authoritative for the port.
        let endpoint = DirectEndpoint {
            ip: found.ip,
            port: grant.port,
        };
        let tls = pinned_client_config(&grant.server_public_key)?;
        let http = Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(self.probe_timeout.max(Duration::from_secs(2)))
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| SyncError::TlsError(format!("direct client: {}", e)))?;

        let channel =
            DirectChannel::login(http, endpoint.base_url(), grant.temporary_credential).await?;
        info!(url = %channel.base_url(), public_ip = %grant.public_ip, "Direct channel established");
        Ok(channel)
    }
}

// =============================================================================
// Link
// =============================================================================

/// Lazily negotiated, shared direct channel.
pub struct DirectLink {
    negotiator: DirectNegotiator,
    channel: tokio::sync::Mutex<Option<Arc<DirectChannel>>>,
    cooldown: Duration,
    failed_at: Mutex<Option<Instant>>,
}

/// Errors meaning the direct path itself is broken rather than the request.
fn falls_back(err: &SyncError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Unauthorized
            | ErrorKind::Unavailable
            | ErrorKind::Transient
            | ErrorKind::TransportClosed
    )
}

impl DirectLink {
    pub fn new(negotiator: DirectNegotiator, cooldown: Duration) -> Self {
        DirectLink {
            negotiator,
            channel: tokio::sync::Mutex::new(None),
            cooldown,
            failed_at: Mutex::new(None),
        }
    }

    pub async fn is_established(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    async fn channel(&self) -> SyncResult<Arc<DirectChannel>> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            return Ok(channel.clone());
        }

        let last_failure = *self.failed_at.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(at) = last_failure {
            if at.elapsed() < self.cooldown {
                return Err(SyncError::Unavailable(
                    "direct negotiation is cooling down".to_string(),
                ));
            }
        }

        match self.negotiator.negotiate().await {
            Ok(channel) => {
                let channel = Arc::new(channel);
                *slot = Some(channel.clone());
                *self.failed_at.lock().unwrap_or_else(|p| p.into_inner()) = None;
                Ok(channel)
            }
            Err(e) => {
                warn!(error = %e, "Direct negotiation failed, using relay");
                *self.failed_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
                Err(SyncError::Unavailable(e.to_string()))
            }
        }
    }

    async fn settle<T>(&self, result: SyncResult<T>) -> SyncResult<T> {
        match result {
            Err(e) if falls_back(&e) => {
                warn!(error = %e, "Direct channel dropped");
                self.close().await;
                Err(SyncError::Unavailable(e.to_string()))
            }
            other => other,
        }
    }

    pub async fn upload(&self, mutation: &Mutation) -> SyncResult<FileNode> {
        let channel = self.channel().await?;
        let result = channel.upload(mutation).await;
        self.settle(result).await
    }

    pub async fn download(&self, id: NodeId) -> SyncResult<Vec<u8>> {
        let channel = self.channel().await?;
        let result = channel.download(id).await;
        self.settle(result).await
    }

    pub async fn preview(&self, id: NodeId) -> SyncResult<Preview> {
        let channel = self.channel().await?;
        let result = channel.preview(id).await;
        self.settle(result).await
    }

    /// Forgets the session; the next transfer negotiates again.
    pub async fn close(&self) {
        self.channel.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use crate::transport::{EventTransport, TransportOptions};
    use tokio::net::UdpSocket;

    #[test]
    fn test_status_kinds() {
        assert_eq!(kind_for_status(StatusCode::UNAUTHORIZED), ErrorKind::Unauthorized);
        assert_eq!(kind_for_status(StatusCode::RANGE_NOT_SATISFIABLE), ErrorKind::InvalidRequest);
        assert_eq!(kind_for_status(StatusCode::BAD_GATEWAY), ErrorKind::Internal);
    }

    #[test]
    fn test_fallback_classification() {
        assert!(falls_back(&SyncError::remote(ErrorKind::Unauthorized, "expired")));
        assert!(falls_back(&SyncError::Unavailable("down".into())));
        assert!(!falls_back(&SyncError::remote(ErrorKind::Conflict, "exists")));
        assert!(!falls_back(&SyncError::NotFound("7".into())));
    }

    #[tokio::test]
    async fn test_failed_negotiation_cools_down() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (left, _right) = EventTransport::in_memory_pair(
            Arc::new(HandlerRegistry::empty()),
            Arc::new(HandlerRegistry::empty()),
            TransportOptions::default(),
        );
        let negotiator = DirectNegotiator::new(left.into(), silent.local_addr().unwrap())
            .with_probe_timeout(Duration::from_millis(100));
        let link = DirectLink::new(negotiator, Duration::from_secs(30));

        let first = link.download(1).await;
        assert!(matches!(first, Err(SyncError::Unavailable(_))));

        let started = std::time::Instant::now();
        let second = link.download(1).await;
        match second {
            Err(SyncError::Unavailable(reason)) => assert!(reason.contains("cooling down")),
            other => panic!("expected cool-down, got {:?}", other.map(|b| b.len())),
        }
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(!link.is_established().await);
    }
}
