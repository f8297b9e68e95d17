//! # Correlated Event Transport
//!
//! Multiplexes named events and correlated queries over one duplex text
//! link (relay WebSocket, axum WebSocket, or an in-memory pair).
//!
//! ## Tasks Per Connection
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       EventTransport                                    │
//! │                                                                         │
//! │   link stream ──► reader task ──► [bounded inbound queue] ──► dispatch  │
//! │                                                               │        │
//! │        ┌──────────────────────────────────────────────────────┤        │
//! │        ▼                        ▼                             ▼        │
//! │  queryResponse            query envelope               event envelope  │
//! │  resolve pending          spawn handler task           await handler   │
//! │  entry (once)             reply via writer             in arrival order│
//! │                                                                         │
//! │   emit / query / replies ──► [bounded outbound queue] ──► writer task  │
//! │                                                          ──► link sink  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Event handlers run on the dispatch task, so they see events in the order
//! they arrived. They must hand long work off (to a channel or a task)
//! rather than await a query on the same transport, since the response to
//! that query is dispatched by the very task they are blocking.
//!
//! ## Pending Queries
//! ```text
//! query() ─► id = uuid v4 ─► pending[id] = oneshot ─► send envelope
//!                                  │
//!          ┌───────────────────────┼──────────────────────┐
//!          ▼                       ▼                      ▼
//!   response arrives         close()                PendingQuery dropped
//!   remove + resolve         drain all → fail       or timed out
//!                            TransportClosed        remove entry
//! ```
//! Whichever path removes the entry first is the only one that completes
//! the query.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures_util::future::{self, BoxFuture};
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{decode_response, EmitOptions, Envelope, Inbound};
use crate::registry::HandlerRegistry;
use crate::shutdown::signalled;

// =============================================================================
// Options
// =============================================================================

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Human readable name used in logs.
    pub label: String,

    /// Envelopes read but not yet dispatched. Default: 256
    pub inbound_capacity: usize,

    /// Envelopes queued for the writer. Default: 256
    pub outbound_capacity: usize,

    /// Deadline for each query. `None` waits until response or close.
    pub query_timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            label: "link".to_string(),
            inbound_capacity: 256,
            outbound_capacity: 256,
            query_timeout: None,
        }
    }
}

impl TransportOptions {
    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }
}

/// Which end of the relay this transport sits on.
#[derive(Clone)]
pub enum LinkRole {
    /// Connected to a relay; outgoing envelopes are marked `forServer`.
    Client,
    /// Accepted by the relay hub; member of the hub's peer set.
    Server(PeerSet),
}

type CloseHandler = Box<dyn FnOnce() + Send>;
type ErrorHandler = Box<dyn Fn(&SyncError) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Event Transport
// =============================================================================

struct Inner {
    id: String,
    label: String,
    role: LinkRole,
    outgoing: mpsc::Sender<String>,
    pending: Mutex<HashMap<String, oneshot::Sender<SyncResult<Value>>>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    error_handlers: Mutex<Vec<ErrorHandler>>,
    query_timeout: Option<Duration>,
}

/// Handle to one relay connection. Cheap to clone.
#[derive(Clone)]
pub struct EventTransport {
    inner: Arc<Inner>,
}

impl EventTransport {
    /// Attaches a transport to a duplex text link and spawns its reader,
    /// dispatch and writer tasks.
    pub fn attach<St, Si>(
        stream: St,
        sink: Si,
        registry: Arc<HandlerRegistry>,
        role: LinkRole,
        options: TransportOptions,
    ) -> EventTransport
    where
        St: Stream<Item = SyncResult<String>> + Send + Unpin + 'static,
        Si: Sink<String> + Send + Unpin + 'static,
        Si::Error: fmt::Display,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(options.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let transport = EventTransport {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                label: options.label,
                role,
                outgoing: outgoing_tx,
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                shutdown: shutdown_tx,
                close_handlers: Mutex::new(Vec::new()),
                error_handlers: Mutex::new(Vec::new()),
                query_timeout: options.query_timeout,
            }),
        };

        if let LinkRole::Server(peers) = &transport.inner.role {
            peers.insert(transport.clone());
        }

        tokio::spawn(write_loop(sink, outgoing_rx, transport.clone()));
        tokio::spawn(read_loop(stream, inbound_tx, transport.clone()));
        tokio::spawn(dispatch_loop(inbound_rx, registry, transport.clone()));

        debug!(link = %transport.inner.label, id = %transport.inner.id, "Transport attached");
        transport
    }

    /// Two transports wired back to back in memory, both in client role.
    pub fn in_memory_pair(
        left_registry: Arc<HandlerRegistry>,
        right_registry: Arc<HandlerRegistry>,
        options: TransportOptions,
    ) -> (EventTransport, EventTransport) {
        let (left_link, right_link) = memory_links();
        let left = EventTransport::attach(
            left_link.stream,
            left_link.sink,
            left_registry,
            LinkRole::Client,
            options.clone().labelled(format!("{}-left", options.label)),
        );
        let right = EventTransport::attach(
            right_link.stream,
            right_link.sink,
            right_registry,
            LinkRole::Client,
            options.clone().labelled(format!("{}-right", options.label)),
        );
        (left, right)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of queries waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Sends a named event.
    ///
    /// On the server side `broadcast` (or `for_peer`) fans the event out to
    /// every connected peer; on the client side the flags ask the relay to
    /// do so.
    pub async fn emit(
        &self,
        name: &str,
        payload: impl Serialize,
        options: EmitOptions,
    ) -> SyncResult<()> {
        let mut envelope = Envelope::event(name, serde_json::to_value(payload)?);
        envelope.broadcast = options.broadcast.then_some(true);
        envelope.for_peer = options.for_peer.then_some(true);

        match &self.inner.role {
            LinkRole::Client => {
                envelope.for_server = Some(true);
                self.send_envelope(envelope).await
            }
            LinkRole::Server(peers) if options.broadcast || options.for_peer => {
                if self.is_closed() {
                    return Err(SyncError::TransportClosed);
                }
                peers.deliver(&envelope.to_json()?, None);
                Ok(())
            }
            LinkRole::Server(_) => self.send_envelope(envelope).await,
        }
    }

    /// Issues a query. The returned future resolves with the response data
    /// or fails with the remote's error, `Timeout` or `TransportClosed`.
    pub fn query(&self, name: &str, payload: impl Serialize) -> PendingQuery {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(e) => return PendingQuery::failed(e.into()),
        };

        let (tx, rx) = oneshot::channel();
        let query_id = {
            let mut pending = lock(&self.inner.pending);
            if self.is_closed() {
                return PendingQuery::failed(SyncError::TransportClosed);
            }
            let mut id = Uuid::new_v4().to_string();
            while pending.contains_key(&id) {
                id = Uuid::new_v4().to_string();
            }
            pending.insert(id.clone(), tx);
            id
        };

        let mut envelope = Envelope::query(name, &query_id, data);
        if matches!(self.inner.role, LinkRole::Client) {
            envelope.for_server = Some(true);
        }

        debug!(link = %self.inner.label, query = %name, query_id = %query_id, "Sending query");

        let transport = self.clone();
        let limit = self.inner.query_timeout;
        let future = async move {
            transport.send_envelope(envelope).await?;
            let outcome = match limit {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(outcome) => outcome,
                    Err(_) => return Err(SyncError::timeout(limit)),
                },
                None => rx.await,
            };
            outcome.unwrap_or(Err(SyncError::TransportClosed))
        }
        .boxed();

        PendingQuery {
            query_id: Some(query_id),
            transport: Some(self.clone()),
            future,
        }
    }

    /// Issues a query and decodes the response into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        name: &str,
        payload: impl Serialize,
    ) -> SyncResult<T> {
        let value = self.query(name, payload).await?;
        serde_json::from_value(value).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }

    async fn send_envelope(&self, envelope: Envelope) -> SyncResult<()> {
        let text = envelope.to_json()?;
        self.send_text(text).await
    }

    async fn send_text(&self, text: String) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::TransportClosed);
        }
        self.inner
            .outgoing
            .send(text)
            .await
            .map_err(|_| SyncError::TransportClosed)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Registers a handler fired once when the transport closes. Fires
    /// immediately if it already has.
    pub fn on_close(&self, handler: impl FnOnce() + Send + 'static) {
        let mut handlers = lock(&self.inner.close_handlers);
        if self.is_closed() {
            drop(handlers);
            handler();
        } else {
            handlers.push(Box::new(handler));
        }
    }

    /// Registers a handler fired for link errors (before the close).
    pub fn on_error(&self, handler: impl Fn(&SyncError) + Send + Sync + 'static) {
        lock(&self.inner.error_handlers).push(Box::new(handler));
    }

    /// Closes the transport. Idempotent.
    ///
    /// Fails every pending query with `TransportClosed`, stops the tasks
    /// (the writer flushes what was already queued and closes the link) and
    /// fires the close handlers.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut pending = lock(&self.inner.pending);
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            pending.drain().map(|(_, tx)| tx).collect()
        };

        let failed = drained.len();
        for tx in drained {
            let _ = tx.send(Err(SyncError::TransportClosed));
        }

        self.inner.shutdown.send_replace(true);

        if let LinkRole::Server(peers) = &self.inner.role {
            peers.remove(&self.inner.id);
        }

        info!(link = %self.inner.label, failed_queries = failed, "Transport closed");

        let handlers = std::mem::take(&mut *lock(&self.inner.close_handlers));
        for handler in handlers {
            handler();
        }
    }

    /// Resolves once the transport has closed.
    pub async fn closed(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        signalled(&mut shutdown).await;
    }

    fn report_error(&self, err: &SyncError) {
        warn!(link = %self.inner.label, error = %err, "Transport error");
        for handler in lock(&self.inner.error_handlers).iter() {
            handler(err);
        }
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    async fn dispatch(&self, registry: &Arc<HandlerRegistry>, text: String) {
        let envelope = match Envelope::from_json(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(link = %self.inner.label, error = %e, "Dropping malformed envelope");
                return;
            }
        };

        if let LinkRole::Server(peers) = &self.inner.role {
            if envelope.is_for_peer() || envelope.is_broadcast() {
                peers.deliver(&text, Some(&self.inner.id));
                if envelope.is_for_peer() {
                    return;
                }
            }
        }

        match envelope.classify() {
            Inbound::Response { query_id, data } => self.resolve(&query_id, decode_response(data)),

            Inbound::Query {
                name,
                query_id,
                data,
            } => {
                let Some(handler) = registry.query(&name).cloned() else {
                    debug!(link = %self.inner.label, query = %name, "No handler for query");
                    let reply = Envelope::error_response(&query_id, &SyncError::MissingHandler(name));
                    let transport = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.send_envelope(reply).await {
                            warn!(query_id = %query_id, error = %e, "Could not refuse unhandled query");
                        }
                    });
                    return;
                };

                let transport = self.clone();
                tokio::spawn(async move {
                    let reply = match handler(data).await {
                        Ok(value) => Envelope::response(&query_id, value),
                        Err(err) => {
                            debug!(query = %name, error = %err, "Query handler failed");
                            Envelope::error_response(&query_id, &err)
                        }
                    };
                    if let Err(e) = transport.send_envelope(reply).await {
                        debug!(query = %name, error = %e, "Could not send query response");
                    }
                });
            }

            Inbound::Event { name, data } => match registry.event(&name) {
                Some(handler) => {
                    if let Err(e) = handler(data).await {
                        warn!(event = %name, error = %e, "Event handler failed");
                    }
                }
                None => debug!(event = %name, "No handler for event, dropped"),
            },
        }
    }

    fn resolve(&self, query_id: &str, outcome: SyncResult<Value>) {
        let sender = lock(&self.inner.pending).remove(query_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(query_id, "Response for unknown or abandoned query"),
        }
    }
}

impl fmt::Debug for EventTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTransport")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Connection Tasks
// =============================================================================

async fn write_loop<Si>(mut sink: Si, mut outgoing: mpsc::Receiver<String>, transport: EventTransport)
where
    Si: Sink<String> + Send + Unpin + 'static,
    Si::Error: fmt::Display,
{
    let mut shutdown = transport.inner.shutdown.subscribe();

    loop {
        tokio::select! {
            biased;

            message = outgoing.recv() => {
                let Some(text) = message else { break };
                if let Err(e) = sink.send(text).await {
                    transport.report_error(&SyncError::WebSocketError(e.to_string()));
                    transport.close();
                    return;
                }
            }

            _ = signalled(&mut shutdown) => {
                // Replies queued before the close still go out.
                while let Ok(text) = outgoing.try_recv() {
                    if sink.send(text).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = sink.close().await;
}

async fn read_loop<St>(mut stream: St, inbound: mpsc::Sender<String>, transport: EventTransport)
where
    St: Stream<Item = SyncResult<String>> + Send + Unpin + 'static,
{
    let mut shutdown = transport.inner.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = signalled(&mut shutdown) => return,

            item = stream.next() => match item {
                Some(Ok(text)) => {
                    if inbound.send(text).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    transport.report_error(&e);
                    break;
                }
                None => {
                    debug!(link = %transport.inner.label, "Link ended");
                    break;
                }
            }
        }
    }
    // Dropping `inbound` lets dispatch drain what was read, then close.
}

async fn dispatch_loop(
    mut inbound: mpsc::Receiver<String>,
    registry: Arc<HandlerRegistry>,
    transport: EventTransport,
) {
    let mut shutdown = transport.inner.shutdown.subscribe();

    loop {
        let text = tokio::select! {
            biased;

            text = inbound.recv() => match text {
                Some(text) => text,
                None => break,
            },
            _ = signalled(&mut shutdown) => return,
        };
        transport.dispatch(&registry, text).await;
    }

    transport.close();
}

// =============================================================================
// Pending Query
// =============================================================================

/// The in-flight result of [`EventTransport::query`].
///
/// Dropping it cancels the query: its pending entry is removed and a late
/// response is ignored.
#[must_use = "a query is cancelled when its PendingQuery is dropped"]
pub struct PendingQuery {
    query_id: Option<String>,
    transport: Option<EventTransport>,
    future: BoxFuture<'static, SyncResult<Value>>,
}

impl PendingQuery {
    fn failed(err: SyncError) -> Self {
        PendingQuery {
            query_id: None,
            transport: None,
            future: future::ready(Err(err)).boxed(),
        }
    }

    /// Correlation id, if the query was registered.
    pub fn id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    /// Abandons the query.
    pub fn cancel(self) {}
}

impl Future for PendingQuery {
    type Output = SyncResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl Drop for PendingQuery {
    fn drop(&mut self) {
        if let (Some(id), Some(transport)) = (&self.query_id, &self.transport) {
            lock(&transport.inner.pending).remove(id);
        }
    }
}

// =============================================================================
// Peer Set (server role)
// =============================================================================

/// Every transport accepted by one relay hub.
#[derive(Clone, Default)]
pub struct PeerSet {
    peers: Arc<RwLock<HashMap<String, EventTransport>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, transport: EventTransport) {
        let mut peers = self.peers.write().unwrap_or_else(|p| p.into_inner());
        peers.insert(transport.id().to_string(), transport);
    }

    fn remove(&self, id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|p| p.into_inner());
        peers.remove(id);
    }

    fn snapshot(&self) -> Vec<EventTransport> {
        let peers = self.peers.read().unwrap_or_else(|p| p.into_inner());
        peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends an event to every connected peer, returning how many got it.
    pub fn broadcast(&self, name: &str, payload: impl Serialize) -> SyncResult<usize> {
        let mut envelope = Envelope::event(name, serde_json::to_value(payload)?);
        envelope.broadcast = Some(true);
        Ok(self.deliver(&envelope.to_json()?, None))
    }

    /// Queues `text` on every peer except `except`.
    ///
    /// Never waits: a peer whose outbound queue is full is disconnected so
    /// that it re-bootstraps instead of silently missing events.
    fn deliver(&self, text: &str, except: Option<&str>) -> usize {
        let mut delivered = 0;
        for peer in self.snapshot() {
            if Some(peer.id()) == except || peer.is_closed() {
                continue;
            }
            match peer.inner.outgoing.try_send(text.to_string()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(peer = %peer.label(), "Peer outbound queue full, disconnecting");
                    peer.close();
                }
                Err(TrySendError::Closed(_)) => peer.close(),
            }
        }
        delivered
    }

    /// Closes every peer transport.
    pub fn close_all(&self) {
        for peer in self.snapshot() {
            peer.close();
        }
    }
}

impl fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSet").field("peers", &self.len()).finish()
    }
}

// =============================================================================
// In-Memory Links
// =============================================================================

/// One end of an in-memory duplex link.
pub struct MemoryLink {
    pub stream: BoxStream<'static, SyncResult<String>>,
    pub sink: UnboundedSender<String>,
}

/// Two link ends connected to each other.
pub fn memory_links() -> (MemoryLink, MemoryLink) {
    let (left_tx, right_rx) = unbounded::<String>();
    let (right_tx, left_rx) = unbounded::<String>();
    (
        MemoryLink {
            stream: left_rx.map(Ok::<String, SyncError>).boxed(),
            sink: left_tx,
        },
        MemoryLink {
            stream: right_rx.map(Ok::<String, SyncError>).boxed(),
            sink: right_tx,
        },
    )
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Expected, RegistryBuilder};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn echo_registry() -> Arc<HandlerRegistry> {
        let registry = RegistryBuilder::new()
            .on_query("echo", |data| async move { Ok(data) })
            .on_query("slowEcho", |data| async move {
                let delay = data["delayMs"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(data)
            })
            .on_query("fail", |_| async {
                Err(SyncError::remote(gobox_core::ErrorKind::Conflict, "name taken"))
            })
            .build(&Expected {
                events: &[],
                queries: &["echo", "slowEcho", "fail"],
            })
            .unwrap();
        Arc::new(registry)
    }

    fn pair() -> (EventTransport, EventTransport) {
        EventTransport::in_memory_pair(
            Arc::new(HandlerRegistry::empty()),
            echo_registry(),
            TransportOptions::default().labelled("test"),
        )
    }

    #[tokio::test]
    async fn test_query_resolves_with_response() {
        let (client, _server) = pair();
        let value = client.query("echo", json!({ "n": 1 })).await.unwrap();
        assert_eq!(value, json!({ "n": 1 }));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_queries_get_their_own_responses() {
        let (client, _server) = pair();

        // Later queries answer first.
        let queries: Vec<_> = (0..8u64)
            .map(|n| client.query("slowEcho", json!({ "n": n, "delayMs": (8 - n) * 5 })))
            .collect();
        let results = futures_util::future::join_all(queries).await;

        for (n, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap()["n"], json!(n));
        }
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let (client, _server) = pair();
        let err = client.query("fail", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), gobox_core::ErrorKind::Conflict);
        assert_eq!(err.to_string(), "name taken");
    }

    #[tokio::test]
    async fn test_unknown_query_fails_instead_of_hanging() {
        let (client, _server) = pair();
        let err = client.query("nope", Value::Null).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote { .. }));
    }

    #[tokio::test]
    async fn test_refusals_do_not_hold_up_later_envelopes() {
        let (client, _server) = pair();
        let refused: Vec<_> = (0..16)
            .map(|_| client.query("nope", Value::Null))
            .collect();
        let answered = client.query("echo", json!("after"));

        let (refused, answered) = tokio::join!(future::join_all(refused), answered);
        assert_eq!(answered.unwrap(), json!("after"));
        for outcome in refused {
            let err = outcome.unwrap_err();
            assert_eq!(err.kind(), gobox_core::ErrorKind::Internal);
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_every_pending_query_once() {
        let (client, _server) = pair();
        let queries: Vec<_> = (0..5)
            .map(|_| client.query("slowEcho", json!({ "delayMs": 10_000 })))
            .collect();

        tokio::task::yield_now().await;
        client.close();
        client.close();

        for result in futures_util::future::join_all(queries).await {
            assert!(matches!(result, Err(SyncError::TransportClosed)));
        }
        assert_eq!(client.pending_count(), 0);
        assert!(matches!(
            client.query("echo", Value::Null).await,
            Err(SyncError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_handlers_fire_once_on_both_sides() {
        let (client, server) = pair();
        let fired = Arc::new(AtomicUsize::new(0));

        for transport in [&client, &server] {
            let fired = fired.clone();
            transport.on_close(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        client.close();
        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        client.close();

        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // Late registration fires immediately.
        let late = fired.clone();
        client.on_close(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dropped_query_leaves_no_pending_entry() {
        let (client, _server) = pair();
        let query = client.query("slowEcho", json!({ "delayMs": 10_000 }));
        assert!(query.id().is_some());
        assert_eq!(client.pending_count(), 1);
        query.cancel();
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_timeout() {
        let (client, _server) = EventTransport::in_memory_pair(
            Arc::new(HandlerRegistry::empty()),
            echo_registry(),
            TransportOptions::default().query_timeout(Some(Duration::from_millis(200))),
        );

        let err = client
            .query("slowEcho", json!({ "delayMs": 5_000 }))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout(200)));
        assert!(err.is_retryable());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_envelopes_do_not_stop_dispatch() {
        let (left, right) = memory_links();
        let server = EventTransport::attach(
            right.stream,
            right.sink,
            echo_registry(),
            LinkRole::Client,
            TransportOptions::default(),
        );

        let mut raw_sink = left.sink;
        let mut raw_stream = left.stream;
        raw_sink.send("{ not json".to_string()).await.unwrap();
        raw_sink.send(r#"{"event":"queryResponse"}"#.to_string()).await.unwrap();
        raw_sink
            .send(r#"{"event":"echo","data":7,"_queryId":"abc"}"#.to_string())
            .await
            .unwrap();

        let reply = raw_stream.next().await.unwrap().unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["event"], "queryResponse");
        assert_eq!(reply["_queryId"], "abc");
        assert_eq!(reply["data"], 7);
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_events_dispatch_in_arrival_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let registry = RegistryBuilder::new()
            .on_event("tick", move |data| {
                let sink = sink.clone();
                async move {
                    lock(&sink).push(data.as_u64().unwrap_or_default());
                    Ok(())
                }
            })
            .build(&Expected {
                events: &["tick"],
                queries: &[],
            })
            .unwrap();

        let (client, server) = EventTransport::in_memory_pair(
            Arc::new(HandlerRegistry::empty()),
            Arc::new(registry),
            TransportOptions::default(),
        );
        for n in 0..20u64 {
            client.emit("tick", n, EmitOptions::default()).await.unwrap();
        }
        client.close();
        server.closed().await;

        assert_eq!(*lock(&seen), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_server_broadcast_reaches_every_peer() {
        let peers = PeerSet::new();
        let received = Arc::new(AtomicUsize::new(0));

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (client_end, server_end) = memory_links();
            EventTransport::attach(
                server_end.stream,
                server_end.sink,
                Arc::new(HandlerRegistry::empty()),
                LinkRole::Server(peers.clone()),
                TransportOptions::default(),
            );

            let counter = received.clone();
            let registry = RegistryBuilder::new()
                .on_event("syncEvent", move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .build(&Expected {
                    events: &["syncEvent"],
                    queries: &[],
                })
                .unwrap();
            clients.push(EventTransport::attach(
                client_end.stream,
                client_end.sink,
                Arc::new(registry),
                LinkRole::Client,
                TransportOptions::default(),
            ));
        }

        assert_eq!(peers.len(), 3);
        assert_eq!(peers.broadcast("syncEvent", json!({})).unwrap(), 3);

        tokio::time::timeout(Duration::from_secs(5), async {
            while received.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        clients[0].close();
        tokio::time::timeout(Duration::from_secs(5), async {
            while peers.len() != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_client_envelopes_are_marked_for_server() {
        let (left, right) = memory_links();
        let client = EventTransport::attach(
            left.stream,
            left.sink,
            Arc::new(HandlerRegistry::empty()),
            LinkRole::Client,
            TransportOptions::default(),
        );
        client
            .emit("syncEvent", json!({}), EmitOptions::broadcast())
            .await
            .unwrap();

        let mut stream = right.stream;
        let text = stream.next().await.unwrap().unwrap();
        let envelope = Envelope::from_json(&text).unwrap();
        assert_eq!(envelope.for_server, Some(true));
        assert!(envelope.is_broadcast());
    }
}
