//! # Domain Types
//!
//! Core domain types used throughout Gobox.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    FileNode     │   │    NodeRef      │   │    Sharing      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (0 = root)  │   │  Id             │   │  file_id        │       │
//! │  │  parent_id      │   │  Child          │   │  shared         │       │
//! │  │  name, visible  │   │  Path           │   │  metadata       │       │
//! │  │  size, mime     │   └─────────────────┘   └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐                              │
//! │  │   SyncEvent     │   │    Mutation     │                              │
//! │  │  ─────────────  │   │  ─────────────  │                              │
//! │  │  kind, origin   │   │  Create/Update  │                              │
//! │  │  node/previous  │   │  Trash/Move     │                              │
//! │  │  token          │   │  (+ content)    │                              │
//! │  └─────────────────┘   └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! Node ids are allocated by the storage node and never reused. Clients
//! adopt them verbatim, so an id means the same node on every device.
//! Authoritative parentage is `parent_id`; a path is always derived.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::validation::split_path;
use crate::ROOT_ID;

/// Node identifier. `0` is the root directory.
pub type NodeId = u64;

/// Current time truncated to millisecond precision.
///
/// Every timestamp stored or sent by Gobox goes through this so that values
/// survive the database, JSON and filesystem mtimes without drift.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Truncates an arbitrary timestamp to the precision used by [`timestamp_now`].
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

// =============================================================================
// File Node
// =============================================================================

/// Mutable attributes of a node.
///
/// `size` and `mime` are meaningful for files only; stores ignore them for
/// directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttrs {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

impl NodeAttrs {
    pub fn new(size: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            size,
            modified_at: normalize_timestamp(modified_at),
            mime: None,
        }
    }

    /// Attributes for a directory: size zero, no mime.
    pub fn directory(modified_at: DateTime<Utc>) -> Self {
        Self::new(0, modified_at)
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }
}

/// A file or directory in the synchronized tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub name: String,
    pub is_directory: bool,
    /// `false` once trashed.
    pub visible: bool,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

impl FileNode {
    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    pub fn attrs(&self) -> NodeAttrs {
        NodeAttrs {
            size: self.size,
            modified_at: self.modified_at,
            mime: self.mime.clone(),
        }
    }

    /// True when `other` describes the same placement and content.
    ///
    /// Used to recognise re-delivered events. `created_at` is ignored since
    /// it never changes after the node is first applied.
    pub fn same_state(&self, other: &FileNode) -> bool {
        self.id == other.id
            && self.parent_id == other.parent_id
            && self.name == other.name
            && self.is_directory == other.is_directory
            && self.visible == other.visible
            && (self.is_directory || (self.size == other.size && self.mime == other.mime))
            && self.modified_at == other.modified_at
    }
}

// =============================================================================
// Node Reference
// =============================================================================

/// The three ways a node can be addressed.
///
/// ```text
/// Id { id: 7 }                              direct lookup
/// Child { parent_id: 0, name: "docs" }      visible child of a directory
/// Path { segments: ["docs", "a.txt"] }      walk from the root
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeRef {
    Id { id: NodeId },
    Child { parent_id: NodeId, name: String },
    Path { segments: Vec<String> },
}

impl NodeRef {
    pub fn id(id: NodeId) -> Self {
        NodeRef::Id { id }
    }

    pub fn child(parent_id: NodeId, name: impl Into<String>) -> Self {
        NodeRef::Child {
            parent_id,
            name: name.into(),
        }
    }

    /// Builds a path reference from a `/` separated string.
    ///
    /// Empty segments are skipped, so `""` and `"/"` both address the root.
    pub fn path(path: &str) -> Self {
        NodeRef::Path {
            segments: split_path(path),
        }
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRef::Id { id } => write!(f, "#{}", id),
            NodeRef::Child { parent_id, name } => write!(f, "#{}/{}", parent_id, name),
            NodeRef::Path { segments } => write!(f, "/{}", segments.join("/")),
        }
    }
}

// =============================================================================
// Sharing
// =============================================================================

/// Sharing record. At most one exists per file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sharing {
    pub file_id: NodeId,
    pub shared: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Sync Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// Where a change was first observed.
///
/// Remote-origin events are never turned back into outbound mutations,
/// which is what breaks feedback loops between devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    Local,
    Remote,
}

/// A committed change to the tree.
///
/// ```text
/// Created   node = new node
/// Modified  node = node after the content change
/// Deleted   node = node after it was marked invisible
/// Moved     node = after, previous = before
/// ```
///
/// `path` is the node's location (names below the root) when the change
/// was committed; `previous_path` is the location before a move. Receivers
/// use them to order work per path without consulting their own tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub kind: SyncEventKind,
    pub node: FileNode,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<FileNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<Vec<String>>,
    /// Monotonic per storage node; orders events for the same node.
    pub token: u64,
    pub origin: Origin,
}

impl SyncEvent {
    pub fn new(
        kind: SyncEventKind,
        node: FileNode,
        path: Vec<String>,
        token: u64,
        origin: Origin,
    ) -> Self {
        Self {
            kind,
            node,
            path,
            previous: None,
            previous_path: None,
            token,
            origin,
        }
    }

    pub fn moved(
        before: FileNode,
        before_path: Vec<String>,
        after: FileNode,
        after_path: Vec<String>,
        token: u64,
        origin: Origin,
    ) -> Self {
        Self {
            kind: SyncEventKind::Moved,
            node: after,
            path: after_path,
            previous: Some(before),
            previous_path: Some(before_path),
            token,
            origin,
        }
    }

    /// The same event as seen by a receiving peer.
    pub fn into_remote(mut self) -> Self {
        self.origin = Origin::Remote;
        self
    }
}

// =============================================================================
// Mutation
// =============================================================================

/// A change requested against the authoritative tree.
///
/// Local changes become mutations sent to the storage node; the storage node
/// commits them and answers with the resulting [`FileNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Mutation {
    Create {
        parent_id: NodeId,
        name: String,
        is_directory: bool,
        modified_at: DateTime<Utc>,
        #[serde(default, with = "content_base64", skip_serializing_if = "Option::is_none")]
        content: Option<Vec<u8>>,
    },
    Update {
        id: NodeId,
        modified_at: DateTime<Utc>,
        #[serde(default, with = "content_base64", skip_serializing_if = "Option::is_none")]
        content: Option<Vec<u8>>,
    },
    Trash {
        id: NodeId,
    },
    Move {
        id: NodeId,
        new_parent_id: NodeId,
        new_name: String,
    },
}

impl Mutation {
    /// The event kind this mutation produces once committed.
    pub fn event_kind(&self) -> SyncEventKind {
        match self {
            Mutation::Create { .. } => SyncEventKind::Created,
            Mutation::Update { .. } => SyncEventKind::Modified,
            Mutation::Trash { .. } => SyncEventKind::Deleted,
            Mutation::Move { .. } => SyncEventKind::Moved,
        }
    }

    /// Existing node targeted by the mutation (`None` for creates).
    pub fn target_id(&self) -> Option<NodeId> {
        match self {
            Mutation::Create { .. } => None,
            Mutation::Update { id, .. } | Mutation::Trash { id } | Mutation::Move { id, .. } => {
                Some(*id)
            }
        }
    }

    pub fn content(&self) -> Option<&[u8]> {
        match self {
            Mutation::Create { content, .. } | Mutation::Update { content, .. } => {
                content.as_deref()
            }
            _ => None,
        }
    }

    /// Removes and returns the content so it can travel on another channel.
    pub fn take_content(&mut self) -> Option<Vec<u8>> {
        match self {
            Mutation::Create { content, .. } | Mutation::Update { content, .. } => content.take(),
            _ => None,
        }
    }
}

mod content_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, parent_id: NodeId, name: &str) -> FileNode {
        let now = timestamp_now();
        FileNode {
            id,
            parent_id,
            name: name.to_string(),
            is_directory: false,
            visible: true,
            size: 500,
            created_at: now,
            modified_at: now,
            mime: Some("text/plain".to_string()),
        }
    }

    #[test]
    fn test_file_node_wire_format_is_camel_case() {
        let json = serde_json::to_value(node(3, 0, "notes.txt")).unwrap();
        assert_eq!(json["parentId"], 0);
        assert_eq!(json["isDirectory"], false);
        assert_eq!(json["name"], "notes.txt");
    }

    #[test]
    fn test_same_state_ignores_created_at() {
        let a = node(3, 0, "notes.txt");
        let mut b = a.clone();
        b.created_at = a.created_at - chrono::Duration::days(1);
        assert!(a.same_state(&b));

        b.size = 501;
        assert!(!a.same_state(&b));
    }

    #[test]
    fn test_node_ref_path_skips_empty_segments() {
        assert_eq!(NodeRef::path("/docs//report.pdf/"), NodeRef::path("docs/report.pdf"));
        assert_eq!(NodeRef::path("/"), NodeRef::Path { segments: vec![] });
        assert_eq!(NodeRef::path("docs/report.pdf").to_string(), "/docs/report.pdf");
    }

    #[test]
    fn test_node_ref_is_tagged() {
        let json = serde_json::to_value(NodeRef::child(4, "a.txt")).unwrap();
        assert_eq!(json["by"], "child");
        assert_eq!(json["parentId"], 4);
    }

    #[test]
    fn test_mutation_content_travels_as_base64() {
        let mutation = Mutation::Create {
            parent_id: 0,
            name: "notes.txt".to_string(),
            is_directory: false,
            modified_at: timestamp_now(),
            content: Some(b"hello".to_vec()),
        };
        let json = serde_json::to_value(&mutation).unwrap();
        assert_eq!(json["op"], "create");
        assert_eq!(json["content"], "aGVsbG8=");

        let back: Mutation = serde_json::from_value(json).unwrap();
        assert_eq!(back.content(), Some(&b"hello"[..]));
        assert_eq!(back.event_kind(), SyncEventKind::Created);
    }

    #[test]
    fn test_mutation_without_content_omits_field() {
        let json = serde_json::to_value(Mutation::Trash { id: 9 }).unwrap();
        assert_eq!(json, serde_json::json!({ "op": "trash", "id": 9 }));
    }

    #[test]
    fn test_into_remote_flips_origin() {
        let event = SyncEvent::new(
            SyncEventKind::Created,
            node(1, 0, "a"),
            vec!["a".to_string()],
            1,
            Origin::Local,
        );
        assert_eq!(event.into_remote().origin, Origin::Remote);
    }

    #[test]
    fn test_moved_event_carries_both_paths() {
        let before = node(4, 0, "a.txt");
        let mut after = before.clone();
        after.name = "b.txt".to_string();
        let event = SyncEvent::moved(
            before,
            vec!["a.txt".to_string()],
            after,
            vec!["b.txt".to_string()],
            7,
            Origin::Local,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "moved");
        assert_eq!(json["previousPath"][0], "a.txt");
        assert_eq!(json["path"][0], "b.txt");
    }
}
