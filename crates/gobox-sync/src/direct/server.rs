//! # Direct HTTPS Server
//!
//! axum routes served over rustls on the storage node.
//!
//! ```text
//! TcpListener ──► TlsAcceptor ──► hyper-util auto::Builder ──► Router
//!                                                               │
//!   POST /directLogin ───────────────────────────────────────────┤ (open)
//!   GET  /file?ID=&preview= ──► require_session ──► fetch_file  ─┤
//!   POST /upload?ID= | ?parentId=&name= ──► require_session ──► upload
//! ```
//!
//! Failures answer with the relay's error body,
//! `{ "_error": { code, message } }`, and a status derived from the kind.

use std::collections::VecDeque;
use std::io::{Seek, SeekFrom};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::header::{
    ACCEPT_RANGES, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, COOKIE, RANGE, SET_COOKIE,
};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use rustls::ServerConfig;
use serde::Deserialize;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use gobox_core::{timestamp_now, ErrorKind, FileNode, Mutation, NodeId};

use super::credentials::CredentialStore;
use super::preview::{mime_of, PreviewRegistry};
use super::session::{bearer_token, cookie_token, session_cookie, SessionSigner};
use super::tls::TlsIdentity;
use super::{LoginReply, LoginRequest, FILE_PATH, LOGIN_PATH, UPLOAD_PATH};
use crate::engine::{Committer, EngineHandle};
use crate::error::{SyncError, SyncResult};
use crate::protocol::error_body;
use crate::shutdown::signalled;

/// Largest accepted upload body.
const MAX_UPLOAD_BYTES: usize = 1 << 30;

/// Subject of every session token; sessions are not tied to a user.
const SESSION_SUBJECT: &str = "direct-client";

/// Read size for streamed file and archive bodies.
const STREAM_CHUNK: usize = 64 * 1024;

// =============================================================================
// Errors
// =============================================================================

/// Failure of a direct request.
#[derive(Debug)]
pub enum DirectError {
    Sync(SyncError),
    /// No preview generator matches (415).
    UnsupportedPreview(String),
    /// Range outside the content (416).
    RangeNotSatisfiable(u64),
}

impl From<SyncError> for DirectError {
    fn from(err: SyncError) -> Self {
        DirectError::Sync(err)
    }
}

impl From<gobox_db::DbError> for DirectError {
    fn from(err: gobox_db::DbError) -> Self {
        DirectError::Sync(err.into())
    }
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvalidState => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Unavailable | ErrorKind::Transient | ErrorKind::TransportClosed => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::Corruption | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for DirectError {
    fn into_response(self) -> Response {
        match self {
            DirectError::Sync(err) => {
                (status_for(err.kind()), Json(error_body(&err))).into_response()
            }
            DirectError::UnsupportedPreview(name) => {
                let err = SyncError::InvalidMessage(format!("no preview available for '{}'", name));
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, Json(error_body(&err))).into_response()
            }
            DirectError::RangeNotSatisfiable(len) => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(CONTENT_RANGE, format!("bytes */{}", len))],
            )
                .into_response(),
        }
    }
}

// =============================================================================
// Ranges
// =============================================================================

/// Outcome of a `Range` header against content of a known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// No usable range: serve everything.
    Full,
    /// Inclusive byte positions.
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parses `bytes=a-b`, `bytes=a-` and `bytes=-n`. Malformed and multi-range
/// headers are ignored.
pub fn parse_range(header: &str, len: u64) -> ByteRange {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((first, last)) = spec.split_once('-') else {
        return ByteRange::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let Ok(suffix) = last.parse::<u64>() else {
            return ByteRange::Full;
        };
        if suffix == 0 || len == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Partial {
            start: len.saturating_sub(suffix),
            end: len - 1,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return ByteRange::Full;
    };
    let requested_end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return ByteRange::Full,
        }
    };
    if start >= len {
        return ByteRange::Unsatisfiable;
    }
    let end = requested_end.map_or(len - 1, |end| end.min(len - 1));
    ByteRange::Partial { start, end }
}

// =============================================================================
// State & Router
// =============================================================================

/// Everything the routes need.
pub struct DirectState {
    /// Orders uploads with every other change to the same paths.
    pub engine: EngineHandle,
    pub committer: Arc<Committer>,
    pub credentials: Arc<CredentialStore>,
    pub signer: Arc<SessionSigner>,
    pub previews: PreviewRegistry,
}

/// Builds the direct-transfer routes.
pub fn router(state: Arc<DirectState>) -> Router {
    let protected = Router::new()
        .route(FILE_PATH, get(fetch_file))
        .route(UPLOAD_PATH, post(upload))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .route(LOGIN_PATH, post(direct_login))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Rejects requests without a valid session token.
async fn require_session(
    State(state): State<Arc<DirectState>>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .or_else(|| {
            headers
                .get(COOKIE)
                .and_then(|value| value.to_str().ok())
                .and_then(cookie_token)
        });

    let Some(token) = token else {
        return DirectError::from(SyncError::Unauthorized("missing session token".into()))
            .into_response();
    };
    match state.signer.validate(token) {
        Ok(_) => next.run(request).await,
        Err(e) => {
            debug!(error = %e, "Rejected direct request");
            DirectError::from(e).into_response()
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn direct_login(
    State(state): State<Arc<DirectState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, DirectError> {
    if let Err(e) = state.credentials.redeem(&request.temporary_credential) {
        info!(error = %e, "Direct login rejected");
        return Err(e.into());
    }
    let token = state.signer.issue(SESSION_SUBJECT)?;
    info!(cookie = request.cookie, "Direct session opened");

    if request.cookie {
        let reply = LoginReply {
            success: true,
            token: None,
        };
        Ok(([(SET_COOKIE, session_cookie(&token))], Json(reply)).into_response())
    } else {
        let reply = LoginReply {
            success: true,
            token: Some(token),
        };
        Ok(Json(reply).into_response())
    }
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    #[serde(rename = "ID")]
    id: NodeId,
    #[serde(default)]
    preview: bool,
}

async fn fetch_file(
    State(state): State<Arc<DirectState>>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Result<Response, DirectError> {
    let node = state.committer.store().get(query.id).await?;
    if !node.visible {
        return Err(SyncError::NotFound(format!("node {} is trashed", node.id)).into());
    }

    if node.is_directory {
        if query.preview {
            return Err(DirectError::UnsupportedPreview(node.name));
        }
        let (archive, len) = zip_directory(&state.committer, &node).await?;
        debug!(id = node.id, bytes = len, "Serving directory archive");
        return Ok((
            [
                (CONTENT_TYPE, "application/zip".to_string()),
                (CONTENT_LENGTH, len.to_string()),
                (
                    CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}.zip\"", node.name),
                ),
            ],
            file_body(archive, 0, len).await?,
        )
            .into_response());
    }

    if query.preview {
        let content = state.committer.read_content(node.id).await?;
        return match state.previews.render(&node, &content) {
            Some(preview) => {
                let preview = preview?;
                Ok(([(CONTENT_TYPE, preview.content_type)], preview.body).into_response())
            }
            None => Err(DirectError::UnsupportedPreview(node.name)),
        };
    }

    let (file, len) = state.committer.open_content(node.id).await?;
    let range = headers
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .map_or(ByteRange::Full, |header| parse_range(header, len));

    match range {
        ByteRange::Full => Ok((
            [
                (CONTENT_TYPE, mime_of(&node)),
                (CONTENT_LENGTH, len.to_string()),
                (ACCEPT_RANGES, "bytes".to_string()),
            ],
            file_body(file, 0, len).await?,
        )
            .into_response()),
        ByteRange::Partial { start, end } => {
            let window = end - start + 1;
            Ok((
                StatusCode::PARTIAL_CONTENT,
                [
                    (CONTENT_TYPE, mime_of(&node)),
                    (CONTENT_LENGTH, window.to_string()),
                    (ACCEPT_RANGES, "bytes".to_string()),
                    (CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len)),
                ],
                file_body(file, start, window).await?,
            )
                .into_response())
        }
        ByteRange::Unsatisfiable => Err(DirectError::RangeNotSatisfiable(len)),
    }
}

/// Streams `len` bytes of `file` from `start`, one chunk at a time.
async fn file_body(mut file: fs::File, start: u64, len: u64) -> SyncResult<Body> {
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let chunks = stream::unfold(Some(file.take(len)), |reader: Option<Take<fs::File>>| async move {
        let mut reader = reader?;
        let mut buf = vec![0u8; STREAM_CHUNK];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(e) => {
                warn!(error = %e, "Read failed while streaming content");
                Some((Err(e), None))
            }
        }
    });
    Ok(Body::from_stream(chunks))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadQuery {
    #[serde(rename = "ID")]
    id: Option<NodeId>,
    parent_id: Option<NodeId>,
    name: Option<String>,
    modified_at: Option<DateTime<Utc>>,
}

async fn upload(
    State(state): State<Arc<DirectState>>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<FileNode>, DirectError> {
    let modified_at = query.modified_at.unwrap_or_else(timestamp_now);
    let content = Some(body.to_vec());

    let mutation = match (query.id, query.parent_id, query.name) {
        (Some(id), _, _) => Mutation::Update {
            id,
            modified_at,
            content,
        },
        (None, Some(parent_id), Some(name)) => Mutation::Create {
            parent_id,
            name,
            is_directory: false,
            modified_at,
            content,
        },
        _ => {
            return Err(SyncError::InvalidMessage(
                "upload needs ID, or parentId and name".to_string(),
            )
            .into())
        }
    };

    let node = state.engine.commit(mutation).await?;
    debug!(id = node.id, size = node.size, "Direct upload committed");
    Ok(Json(node))
}

// =============================================================================
// Directory archives
// =============================================================================

struct ArchiveEntry {
    name: String,
    path: PathBuf,
    is_directory: bool,
}

/// Zips the visible subtree of `dir` into an anonymous file under the
/// staging directory, returning it rewound along with its length.
async fn zip_directory(committer: &Committer, dir: &FileNode) -> SyncResult<(fs::File, u64)> {
    let base = committer.path_of(dir.id).await?;
    let mut entries = Vec::new();
    let mut queue = VecDeque::from([(dir.id, String::new(), base)]);

    while let Some((id, prefix, path)) = queue.pop_front() {
        for child in committer.store().children(id).await? {
            let name = format!("{}{}", prefix, child.name);
            let child_path = path.join(&child.name);
            if child.is_directory {
                queue.push_back((child.id, format!("{}/", name), child_path.clone()));
            }
            entries.push(ArchiveEntry {
                name,
                path: child_path,
                is_directory: child.is_directory,
            });
        }
    }

    let spool_dir = committer.staging_dir().to_path_buf();
    let (spool, len) = tokio::task::spawn_blocking(move || write_archive(entries, &spool_dir))
        .await
        .map_err(|e| SyncError::Internal(e.to_string()))??;
    Ok((fs::File::from_std(spool), len))
}

fn write_archive(entries: Vec<ArchiveEntry>, spool_dir: &Path) -> SyncResult<(std::fs::File, u64)> {
    let zip_err = |e: zip::result::ZipError| SyncError::Internal(format!("zip: {}", e));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    std::fs::create_dir_all(spool_dir)?;
    // Unlinked on creation; the space is released when the body is dropped.
    let mut archive = ZipWriter::new(tempfile::tempfile_in(spool_dir)?);

    for entry in entries {
        if entry.is_directory {
            archive
                .add_directory(format!("{}/", entry.name), options)
                .map_err(zip_err)?;
            continue;
        }
        let mut source = match std::fs::File::open(&entry.path) {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %entry.path.display(), "File vanished while archiving");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        archive.start_file(entry.name, options).map_err(zip_err)?;
        std::io::copy(&mut source, &mut archive)?;
    }

    let mut spool = archive.finish().map_err(zip_err)?;
    let len = spool.seek(SeekFrom::End(0))?;
    spool.rewind()?;
    Ok((spool, len))
}

// =============================================================================
// Server
// =============================================================================

/// HTTPS server for direct transfers.
pub struct DirectServer {
    bind: SocketAddr,
    tls: Arc<ServerConfig>,
    state: Arc<DirectState>,
}

/// Handle to a running [`DirectServer`].
pub struct DirectServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DirectServer {
    pub fn new(bind: SocketAddr, identity: &TlsIdentity, state: DirectState) -> SyncResult<Self> {
        Ok(DirectServer {
            bind,
            tls: identity.server_config()?,
            state: Arc::new(state),
        })
    }

    /// Binds the listener and starts accepting TLS connections.
    pub async fn start(self) -> SyncResult<DirectServerHandle> {
        let listener = TcpListener::bind(self.bind).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind to {}: {}", self.bind, e))
        })?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let acceptor = TlsAcceptor::from(self.tls);
        let app = router(self.state);
        let task = tokio::spawn(accept_loop(listener, acceptor, app, shutdown_rx));

        info!(addr = %local_addr, "Direct transfer server started");
        Ok(DirectServerHandle {
            local_addr,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = signalled(&mut shutdown_rx) => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Direct accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |request: axum::http::Request<Incoming>| {
                app.clone().oneshot(request)
            });
            let builder = ConnectionBuilder::new(TokioExecutor::new());
            let connection = builder.serve_connection(TokioIo::new(tls), service);
            tokio::pin!(connection);

            tokio::select! {
                served = connection.as_mut() => {
                    if let Err(e) = served {
                        debug!(%peer, error = %e, "Direct connection ended with error");
                    }
                }
                _ = signalled(&mut shutdown) => {
                    connection.as_mut().graceful_shutdown();
                    let _ = connection.await;
                }
            }
        });
    }
    info!("Direct transfer server stopped");
}

impl DirectServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes open connections. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
