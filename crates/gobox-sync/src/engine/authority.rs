//! # Authority
//!
//! Where a local change is committed and where file content comes from.
//!
//! ```text
//! ┌──────────────────────┐            ┌──────────────────────────────────┐
//! │ client engine        │            │ storage engine                   │
//! │                      │            │                                  │
//! │  RelayAuthority      │            │  LocalAuthority                  │
//! │   content? ─► direct │── HTTPS ──►│   Committer (store, broadcast)   │
//! │   else / Unavailable │            │                                  │
//! │   ─► relay query     │── relay ──►│   createNode / updateNode / …    │
//! └──────────────────────┘            └──────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use gobox_core::{FileNode, Mutation};

use crate::connector::RelayLink;
use crate::direct::DirectLink;
use crate::engine::storage::Committer;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{channels, mutation_channel, ContentReply, NodeIdRequest};

#[async_trait]
pub trait Authority: Send + Sync {
    /// Commits a mutation and returns the resulting node.
    async fn submit(&self, mutation: Mutation) -> SyncResult<FileNode>;

    /// Current content of a file node.
    async fn fetch_content(&self, node: &FileNode) -> SyncResult<Vec<u8>>;
}

// =============================================================================
// Local (storage node)
// =============================================================================

/// Commits straight into the storage node's own tree.
pub struct LocalAuthority {
    committer: Arc<Committer>,
}

impl LocalAuthority {
    pub fn new(committer: Arc<Committer>) -> Self {
        LocalAuthority { committer }
    }
}

#[async_trait]
impl Authority for LocalAuthority {
    async fn submit(&self, mutation: Mutation) -> SyncResult<FileNode> {
        self.committer
            .commit(mutation, gobox_core::Origin::Local)
            .await
    }

    async fn fetch_content(&self, node: &FileNode) -> SyncResult<Vec<u8>> {
        self.committer.read_content(node.id).await
    }
}

// =============================================================================
// Relay (client node)
// =============================================================================

/// Commits through the storage node, preferring a direct channel for
/// content and falling back to the relay whenever it is unavailable.
pub struct RelayAuthority {
    relay: RelayLink,
    direct: Option<Arc<DirectLink>>,
}

impl RelayAuthority {
    pub fn new(relay: RelayLink) -> Self {
        RelayAuthority {
            relay,
            direct: None,
        }
    }

    pub fn with_direct(mut self, direct: Arc<DirectLink>) -> Self {
        self.direct = Some(direct);
        self
    }
}

#[async_trait]
impl Authority for RelayAuthority {
    async fn submit(&self, mutation: Mutation) -> SyncResult<FileNode> {
        if let (Some(direct), Some(_)) = (&self.direct, mutation.content()) {
            match direct.upload(&mutation).await {
                Ok(node) => return Ok(node),
                Err(SyncError::Unavailable(reason)) => {
                    debug!(%reason, "Direct upload unavailable, using relay");
                }
                Err(other) => return Err(other),
            }
        }

        let transport = self.relay.current()?;
        transport
            .request(mutation_channel(&mutation), &mutation)
            .await
    }

    async fn fetch_content(&self, node: &FileNode) -> SyncResult<Vec<u8>> {
        if let Some(direct) = &self.direct {
            match direct.download(node.id).await {
                Ok(bytes) => return Ok(bytes),
                Err(SyncError::Unavailable(reason)) => {
                    debug!(id = node.id, %reason, "Direct download unavailable, using relay");
                }
                Err(other) => return Err(other),
            }
        }

        let transport = self.relay.current()?;
        let reply: ContentReply = transport
            .request(channels::FETCH_CONTENT, NodeIdRequest { id: node.id })
            .await?;
        reply.into_bytes()
    }
}
