//! # Nodes
//!
//! Wires the components of a storage or client node together.
//!
//! ## Storage Node
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           StorageNode                                   │
//! │                                                                         │
//! │  FsWatcher ──► SyncEngine ──► LocalAuthority ──► Committer ──► store    │
//! │                    ▲                                  │                 │
//! │  HubServer ── createNode / updateNode / … ────────────┘ broadcast       │
//! │   (relay)  ── fetchContent, listChildren, resolveNode, sharing, purge   │
//! │            ── directCredential ──► CredentialStore                      │
//! │                                                                         │
//! │  DiscoveryResponder (UDP)      DirectServer (HTTPS) ──► SyncEngine      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Client Node
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            ClientNode                                   │
//! │                                                                         │
//! │  FsWatcher ──► SyncEngine ──► RelayAuthority ──► DirectLink | relay     │
//! │                    ▲                                                    │
//! │  RelayConnector ── syncEvent ──┘                                        │
//! │       └── on every (re)connect: pull_remote_tree                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Shutdown Order
//! watcher → engine → transports → hub / discovery / HTTPS listeners →
//! cached credentials → database pool. Each step is idempotent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gobox_core::{FileNode, Mutation, NodeRef, Sharing, SyncEvent};
use gobox_db::{Database, SharingRepository};

use crate::config::{GoboxConfig, NodeRole, SharedConfig};
use crate::connector::{ConnectionState, ConnectorHandle, RelayConnector, RelayLink};
use crate::direct::{
    CredentialStore, DirectLink, DirectNegotiator, DirectServer, DirectServerHandle, DirectState,
    PreviewRegistry, SessionSigner, TlsIdentity,
};
use crate::discovery::DiscoveryResponder;
use crate::engine::bootstrap::{pull_remote_tree, scan_local};
use crate::engine::fsops::INTERNAL_DIR;
use crate::engine::{
    Committer, EchoGuard, EngineHandle, LocalAuthority, RelayAuthority, SyncEngine, SyncObserver,
};
use crate::error::{SyncError, SyncResult};
use crate::hub::{HubHandle, HubServer};
use crate::protocol::{
    channels, mutation_channel, ContentReply, DirectGrant, NodeIdRequest, PurgeReply,
    SetSharingRequest, SharingRequest,
};
use crate::registry::{Expected, HandlerRegistry, RegistryBuilder};
use crate::transport::PeerSet;
use crate::watcher::FsWatcher;

// =============================================================================
// Status
// =============================================================================

/// Snapshot of a running node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub role: NodeRole,
    /// Relay connection (client) or whether the hub is serving (storage).
    pub connection: ConnectionState,
    /// Connected relay peers (storage only).
    pub peers: usize,
    /// Paths with queued or running work.
    pub pending: usize,
    pub last_error: Option<String>,
}

/// Remembers the last failure the engine reported.
#[derive(Default)]
struct StatusRecorder {
    last_error: Mutex<Option<String>>,
}

impl StatusRecorder {
    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl SyncObserver for StatusRecorder {
    fn on_failure(&self, path: &std::path::Path, error: &SyncError) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(format!("{}: {}", path.display(), error));
    }
}

async fn open_database(config: &GoboxConfig) -> SyncResult<Database> {
    tokio::fs::create_dir_all(config.storage.root.join(INTERNAL_DIR)).await?;
    let db_config = config.db_config();
    if let Some(parent) = db_config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(Database::new(db_config).await?)
}

// =============================================================================
// Storage Node
// =============================================================================

/// What a `directCredential` reply is built from.
#[derive(Clone)]
struct GrantIssuer {
    credentials: Arc<CredentialStore>,
    public_ip: String,
    port: u16,
    server_public_key: String,
}

impl GrantIssuer {
    fn grant(&self) -> DirectGrant {
        let purged = self.credentials.purge_expired();
        if purged > 0 {
            debug!(purged, "Dropped expired direct credentials");
        }
        DirectGrant {
            temporary_credential: self.credentials.issue(),
            public_ip: self.public_ip.clone(),
            port: self.port,
            server_public_key: self.server_public_key.clone(),
        }
    }
}

/// Query handler committing one kind of mutation through the engine.
fn commit_handler(
    engine: EngineHandle,
    channel: &'static str,
) -> impl Fn(Mutation) -> BoxFuture<'static, SyncResult<FileNode>> + Send + Sync + 'static {
    move |mutation: Mutation| {
        let engine = engine.clone();
        async move {
            if mutation_channel(&mutation) != channel {
                return Err(SyncError::InvalidMessage(format!(
                    "'{}' cannot carry a {:?} mutation",
                    channel,
                    mutation.event_kind()
                )));
            }
            engine.commit(mutation).await
        }
        .boxed()
    }
}

/// Every query a storage node answers over the relay.
fn storage_registry(
    engine: EngineHandle,
    committer: Arc<Committer>,
    sharing: SharingRepository,
    grants: Option<GrantIssuer>,
) -> SyncResult<HandlerRegistry> {
    let fetch = committer.clone();
    let list = committer.clone();
    let resolve = committer.clone();
    let purge = committer;
    let get_sharing = sharing.clone();
    let set_sharing = sharing;

    RegistryBuilder::new()
        .on_typed_query::<Mutation, FileNode, _, _>(
            channels::CREATE_NODE,
            commit_handler(engine.clone(), channels::CREATE_NODE),
        )
        .on_typed_query::<Mutation, FileNode, _, _>(
            channels::UPDATE_NODE,
            commit_handler(engine.clone(), channels::UPDATE_NODE),
        )
        .on_typed_query::<Mutation, FileNode, _, _>(
            channels::TRASH_NODE,
            commit_handler(engine.clone(), channels::TRASH_NODE),
        )
        .on_typed_query::<Mutation, FileNode, _, _>(
            channels::MOVE_NODE,
            commit_handler(engine, channels::MOVE_NODE),
        )
        .on_typed_query(channels::FETCH_CONTENT, move |req: NodeIdRequest| {
            let committer = fetch.clone();
            async move {
                let bytes = committer.read_content(req.id).await?;
                Ok::<_, SyncError>(ContentReply::new(req.id, &bytes))
            }
        })
        .on_typed_query(channels::LIST_CHILDREN, move |req: NodeIdRequest| {
            let committer = list.clone();
            async move { committer.store().children(req.id).await.map_err(SyncError::from) }
        })
        .on_typed_query(channels::RESOLVE_NODE, move |node_ref: NodeRef| {
            let committer = resolve.clone();
            async move { committer.store().resolve(&node_ref).await.map_err(SyncError::from) }
        })
        .on_typed_query(channels::PURGE_NODE, move |req: NodeIdRequest| {
            let committer = purge.clone();
            async move {
                let purged = committer.purge(req.id).await?;
                Ok::<_, SyncError>(PurgeReply { purged })
            }
        })
        .on_typed_query(channels::GET_SHARING, move |req: SharingRequest| {
            let sharing = get_sharing.clone();
            async move { sharing.find(req.file_id).await.map_err(SyncError::from) }
        })
        .on_typed_query(channels::SET_SHARING, move |req: SetSharingRequest| {
            let sharing = set_sharing.clone();
            async move {
                let record: Sharing = sharing.set(req.file_id, req.shared, req.metadata).await?;
                Ok::<_, SyncError>(record)
            }
        })
        .on_query(channels::DIRECT_CREDENTIAL, move |_: Value| {
            let grants = grants.clone();
            async move {
                let issuer = grants.ok_or_else(|| {
                    SyncError::Unavailable("direct transfer is disabled".to_string())
                })?;
                Ok::<_, SyncError>(serde_json::to_value(issuer.grant())?)
            }
        })
        .build(&Expected {
            events: &[],
            queries: channels::STORAGE_QUERIES,
        })
}

/// The authoritative node: owns the tree and serves the relay.
pub struct StorageNode {
    config: SharedConfig,
    db: Database,
    committer: Arc<Committer>,
    engine: EngineHandle,
    peers: PeerSet,
    status: Arc<StatusRecorder>,
    credentials: Arc<CredentialStore>,
    direct: Option<DirectServerHandle>,
    discovery: Option<DiscoveryResponder>,
    hub: Option<HubHandle>,
    watcher: Option<FsWatcher>,
    stopped: AtomicBool,
}

impl StorageNode {
    /// Opens the store and starts every storage component.
    ///
    /// A failure part way through stops whatever was already started.
    pub async fn start(shared: SharedConfig) -> SyncResult<Self> {
        let config = shared.get();
        let root = config.storage.root.clone();
        info!(root = %root.display(), name = %config.node.name, "Starting storage node");

        let db = open_database(&config).await?;
        let peers = PeerSet::new();
        let engine_config = config.engine_config();
        let echo = Arc::new(EchoGuard::new(engine_config.echo_window));
        let committer = Arc::new(Committer::new(
            db.tree(),
            &root,
            echo.clone(),
            Arc::new(peers.clone()),
        ));
        let status = Arc::new(StatusRecorder::default());
        let engine = SyncEngine::new(
            engine_config,
            db.tree(),
            Arc::new(LocalAuthority::new(committer.clone())),
        )
        .with_committer(committer.clone())
        .with_echo(echo)
        .with_observer(status.clone())
        .spawn();

        let mut node = StorageNode {
            config: shared,
            credentials: Arc::new(CredentialStore::new(Duration::from_secs(
                config.direct.credential_ttl_secs,
            ))),
            db,
            committer,
            engine,
            peers,
            status,
            direct: None,
            discovery: None,
            hub: None,
            watcher: None,
            stopped: AtomicBool::new(false),
        };

        if let Err(e) = node.launch(&config).await {
            warn!(error = %e, "Storage node failed to start");
            node.shutdown().await;
            return Err(e);
        }
        info!("Storage node started");
        Ok(node)
    }

    async fn launch(&mut self, config: &GoboxConfig) -> SyncResult<()> {
        let grants = if config.direct.enabled {
            Some(self.start_direct(config).await?)
        } else {
            None
        };

        let registry = storage_registry(
            self.engine.clone(),
            self.committer.clone(),
            self.db.sharing(),
            grants,
        )?;
        let hub = HubServer::new(config.hub_config(), Arc::new(registry), self.peers.clone())
            .start()
            .await?;
        self.hub = Some(hub);

        let root = config.storage.root.clone();
        self.watcher = Some(FsWatcher::start(&root, self.engine.clone())?);
        let queued = scan_local(&root, &self.engine).await?;
        debug!(queued, "Initial scan queued");
        Ok(())
    }

    async fn start_direct(&mut self, config: &GoboxConfig) -> SyncResult<GrantIssuer> {
        let identity = TlsIdentity::generate(vec![config.node.name.clone(), "localhost".into()])?;
        let session_ttl = Duration::from_secs(config.direct.session_ttl_secs);
        let signer = match &config.direct.session_secret {
            Some(secret) => SessionSigner::new(secret.as_bytes(), session_ttl),
            None => SessionSigner::random(session_ttl),
        };

        let state = DirectState {
            engine: self.engine.clone(),
            committer: self.committer.clone(),
            credentials: self.credentials.clone(),
            signer: Arc::new(signer),
            previews: PreviewRegistry::with_builtin(),
        };
        let server = DirectServer::new(config.direct_bind()?, &identity, state)?
            .start()
            .await?;
        let addr = server.local_addr();
        self.direct = Some(server);

        self.discovery = Some(DiscoveryResponder::start(config.discovery_bind()?, addr.port()).await?);

        let public_ip = config
            .direct
            .public_ip
            .clone()
            .unwrap_or_else(|| addr.ip().to_string());
        Ok(GrantIssuer {
            credentials: self.credentials.clone(),
            public_ip,
            port: addr.port(),
            server_public_key: identity.public_key(),
        })
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn committer(&self) -> &Arc<Committer> {
        &self.committer
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn hub_addr(&self) -> Option<SocketAddr> {
        self.hub.as_ref().map(HubHandle::local_addr)
    }

    pub fn direct_addr(&self) -> Option<SocketAddr> {
        self.direct.as_ref().map(DirectServerHandle::local_addr)
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.as_ref().map(DiscoveryResponder::local_addr)
    }

    pub fn status(&self) -> NodeStatus {
        let serving = self.hub.is_some() && !self.stopped.load(Ordering::SeqCst);
        NodeStatus {
            role: NodeRole::Storage,
            connection: if serving {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
            peers: self.peers.len(),
            pending: self.engine.pending(),
            last_error: self.status.last_error(),
        }
    }

    /// Stops everything in order. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down storage node");

        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        self.engine.shutdown().await;
        self.peers.close_all();
        if let Some(hub) = &self.hub {
            hub.shutdown().await;
        }
        if let Some(discovery) = &self.discovery {
            discovery.stop().await;
        }
        if let Some(direct) = &self.direct {
            direct.shutdown().await;
        }
        self.credentials.clear();
        self.db.close().await;
        info!("Storage node stopped");
    }
}

// =============================================================================
// Client Node
// =============================================================================

/// A mirror of the storage node's tree, synced through the relay.
pub struct ClientNode {
    config: SharedConfig,
    db: Database,
    engine: EngineHandle,
    connector: ConnectorHandle,
    direct: Option<Arc<DirectLink>>,
    status: Arc<StatusRecorder>,
    watcher: Option<FsWatcher>,
    resync: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ClientNode {
    /// Connects to the relay, pulls the remote tree and starts watching.
    ///
    /// An unreachable relay is not an error: the connector keeps retrying
    /// and the tree is pulled once it connects.
    pub async fn start(shared: SharedConfig) -> SyncResult<Self> {
        let config = shared.get();
        let root = config.storage.root.clone();
        let connector_config = config.connector_config().ok_or_else(|| {
            SyncError::InvalidConfig("relay.url is required for client nodes".into())
        })?;
        info!(root = %root.display(), relay = %connector_config.url, "Starting client node");

        let db = open_database(&config).await?;

        // Events can arrive before the engine exists; the pull after
        // connecting covers anything dropped here.
        let slot: Arc<OnceLock<EngineHandle>> = Arc::default();
        let events = slot.clone();
        let registry = RegistryBuilder::new()
            .on_typed_event(channels::SYNC_EVENT, move |event: SyncEvent| {
                let events = events.clone();
                async move {
                    match events.get() {
                        Some(engine) => engine.remote_event(event).await,
                        None => {
                            debug!(path = ?event.path, "Engine not started, dropping sync event");
                            Ok(())
                        }
                    }
                }
            })
            .build(&Expected {
                events: channels::CLIENT_EVENTS,
                queries: &[],
            })?;

        let connector = RelayConnector::spawn(connector_config, Arc::new(registry));
        let relay = RelayLink::Connector(connector.clone());

        let direct = config.direct.enabled.then(|| {
            let negotiator = DirectNegotiator::new(relay.clone(), config.probe_target())
                .with_probe_timeout(Duration::from_millis(config.direct.probe_timeout_ms));
            Arc::new(DirectLink::new(
                negotiator,
                Duration::from_secs(config.direct.cooldown_secs),
            ))
        });
        let mut authority = RelayAuthority::new(relay);
        if let Some(link) = &direct {
            authority = authority.with_direct(link.clone());
        }

        let status = Arc::new(StatusRecorder::default());
        let engine = SyncEngine::new(config.engine_config(), db.tree(), Arc::new(authority))
            .with_observer(status.clone())
            .spawn();
        let _ = slot.set(engine.clone());

        let mut node = ClientNode {
            config: shared,
            db,
            engine,
            connector,
            direct,
            status,
            watcher: None,
            resync: Mutex::new(None),
            stopped: AtomicBool::new(false),
        };

        if let Err(e) = node.launch(&config).await {
            warn!(error = %e, "Client node failed to start");
            node.shutdown().await;
            return Err(e);
        }
        info!("Client node started");
        Ok(node)
    }

    async fn launch(&mut self, config: &GoboxConfig) -> SyncResult<()> {
        let mut updates = self.connector.subscribe();
        let limit = Duration::from_secs(config.relay.connect_timeout_secs);
        match self.connector.connected(limit).await {
            Ok(transport) => {
                if let Err(e) = pull_remote_tree(&transport, &self.db.tree(), &self.engine).await {
                    warn!(error = %e, "Initial pull failed, retrying on reconnect");
                }
            }
            Err(e) => warn!(error = %e, "Relay not reachable yet"),
        }

        let engine = self.engine.clone();
        let mirror = self.db.tree();
        let resync = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let transport = updates.borrow_and_update().clone();
                let Some(transport) = transport.filter(|t| !t.is_closed()) else {
                    continue;
                };
                match pull_remote_tree(&transport, &mirror, &engine).await {
                    Ok(queued) => info!(queued, "Resynced after reconnect"),
                    Err(e) => warn!(error = %e, "Resync after reconnect failed"),
                }
            }
        });
        *self.resync.lock().unwrap_or_else(|p| p.into_inner()) = Some(resync);

        let root = config.storage.root.clone();
        self.watcher = Some(FsWatcher::start(&root, self.engine.clone())?);
        let queued = scan_local(&root, &self.engine).await?;
        debug!(queued, "Initial scan queued");
        Ok(())
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn connector(&self) -> &ConnectorHandle {
        &self.connector
    }

    pub fn direct(&self) -> Option<&Arc<DirectLink>> {
        self.direct.as_ref()
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            role: NodeRole::Client,
            connection: self.connector.state().await,
            peers: 0,
            pending: self.engine.pending(),
            last_error: self.status.last_error(),
        }
    }

    /// Stops everything in order. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down client node");

        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        self.engine.shutdown().await;
        let resync = self.resync.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = resync {
            task.abort();
        }
        self.connector.shutdown();
        if let Some(direct) = &self.direct {
            direct.close().await;
        }
        self.db.close().await;
        info!("Client node stopped");
    }
}
