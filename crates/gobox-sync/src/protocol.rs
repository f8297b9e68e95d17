//! # Relay Protocol
//!
//! The envelope carried over every relay connection, the names of the
//! events and queries Gobox nodes exchange, and their payloads.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Relay Envelope Traffic                             │
//! │                                                                         │
//! │  EVENT (fire and forget)                                               │
//! │  ───────────────────────                                               │
//! │  STORAGE ───► { event: "syncEvent", data: SyncEvent, broadcast: true } │
//! │                                                                         │
//! │  QUERY (correlated)                                                    │
//! │  ──────────────────                                                    │
//! │  CLIENT  ───► { event: "createNode", data: Mutation,                   │
//! │                 _queryId: "7c1e…", forServer: true }                   │
//! │  STORAGE ◄─── { event: "queryResponse", _queryId: "7c1e…",             │
//! │                 data: FileNode }                                       │
//! │                                                                         │
//! │  QUERY FAILURE                                                         │
//! │  ─────────────                                                         │
//! │  STORAGE ◄─── { event: "queryResponse", _queryId: "7c1e…",             │
//! │                 data: { _error: { code: "CONFLICT", message } } }      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! ```json
//! { "event": "listChildren", "data": { "id": 0 }, "_queryId": "…", "forServer": true }
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use gobox_core::{ErrorKind, FileNode, Mutation, NodeId, SyncEventKind};

use crate::error::{SyncError, SyncResult};

/// Event name every query response carries.
pub const QUERY_RESPONSE: &str = "queryResponse";

/// Key under which a failed query reports its error.
pub const ERROR_KEY: &str = "_error";

// =============================================================================
// Channel Names
// =============================================================================

/// Event and query names used between storage and client nodes.
pub mod channels {
    /// Storage → clients: a committed tree change.
    pub const SYNC_EVENT: &str = "syncEvent";

    pub const CREATE_NODE: &str = "createNode";
    pub const UPDATE_NODE: &str = "updateNode";
    pub const TRASH_NODE: &str = "trashNode";
    pub const MOVE_NODE: &str = "moveNode";
    pub const PURGE_NODE: &str = "purgeNode";
    pub const FETCH_CONTENT: &str = "fetchContent";
    pub const LIST_CHILDREN: &str = "listChildren";
    pub const RESOLVE_NODE: &str = "resolveNode";
    pub const GET_SHARING: &str = "getSharing";
    pub const SET_SHARING: &str = "setSharing";
    pub const DIRECT_CREDENTIAL: &str = "directCredential";

    /// Queries a storage node answers.
    pub const STORAGE_QUERIES: &[&str] = &[
        CREATE_NODE,
        UPDATE_NODE,
        TRASH_NODE,
        MOVE_NODE,
        PURGE_NODE,
        FETCH_CONTENT,
        LIST_CHILDREN,
        RESOLVE_NODE,
        GET_SHARING,
        SET_SHARING,
        DIRECT_CREDENTIAL,
    ];

    /// Events a client node listens for.
    pub const CLIENT_EVENTS: &[&str] = &[SYNC_EVENT];
}

/// Query name a mutation travels under.
pub fn mutation_channel(mutation: &Mutation) -> &'static str {
    match mutation.event_kind() {
        SyncEventKind::Created => channels::CREATE_NODE,
        SyncEventKind::Modified => channels::UPDATE_NODE,
        SyncEventKind::Deleted => channels::TRASH_NODE,
        SyncEventKind::Moved => channels::MOVE_NODE,
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// One message on a relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,

    #[serde(default)]
    pub data: Value,

    #[serde(rename = "_queryId", default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,

    /// Set by clients: addressed to the storage node behind the relay.
    #[serde(rename = "forServer", default, skip_serializing_if = "Option::is_none")]
    pub for_server: Option<bool>,

    /// Addressed to the other peers only; the relay does not dispatch it.
    #[serde(rename = "forPeer", default, skip_serializing_if = "Option::is_none")]
    pub for_peer: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<bool>,
}

impl Envelope {
    pub fn event(name: &str, data: Value) -> Self {
        Envelope {
            event: name.to_string(),
            data,
            query_id: None,
            for_server: None,
            for_peer: None,
            broadcast: None,
        }
    }

    pub fn query(name: &str, query_id: &str, data: Value) -> Self {
        Envelope {
            query_id: Some(query_id.to_string()),
            ..Envelope::event(name, data)
        }
    }

    pub fn response(query_id: &str, data: Value) -> Self {
        Envelope::query(QUERY_RESPONSE, query_id, data)
    }

    /// Response reporting `err` to the querying side.
    pub fn error_response(query_id: &str, err: &SyncError) -> Self {
        Envelope::response(query_id, error_body(err))
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast.unwrap_or(false)
    }

    pub fn is_for_peer(&self) -> bool {
        self.for_peer.unwrap_or(false)
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses one envelope, rejecting the shapes dispatch can't route.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| SyncError::InvalidMessage(e.to_string()))?;

        if envelope.event.is_empty() {
            return Err(SyncError::InvalidMessage("empty event name".into()));
        }
        if envelope.event == QUERY_RESPONSE && envelope.query_id.is_none() {
            return Err(SyncError::InvalidMessage(
                "queryResponse without _queryId".into(),
            ));
        }
        Ok(envelope)
    }

    /// Classifies the envelope for dispatch.
    pub fn classify(self) -> Inbound {
        match self.query_id {
            Some(query_id) if self.event == QUERY_RESPONSE => Inbound::Response {
                query_id,
                data: self.data,
            },
            Some(query_id) => Inbound::Query {
                name: self.event,
                query_id,
                data: self.data,
            },
            None => Inbound::Event {
                name: self.event,
                data: self.data,
            },
        }
    }
}

/// Closed set of things an inbound envelope can be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to one of our pending queries.
    Response { query_id: String, data: Value },
    /// A query we must answer.
    Query {
        name: String,
        query_id: String,
        data: Value,
    },
    /// A fire-and-forget event.
    Event { name: String, data: Value },
}

/// `{ "_error": { code, message } }` describing `err`. Also the body of
/// failed direct-transfer requests.
pub fn error_body(err: &SyncError) -> Value {
    json!({ ERROR_KEY: { "code": err.kind(), "message": err.to_string() } })
}

/// Turns response data into the query's outcome.
///
/// `{ "_error": { code, message } }` becomes [`SyncError::Remote`] with the
/// remote's message kept verbatim; anything else is the result.
pub fn decode_response(data: Value) -> SyncResult<Value> {
    let Some(error) = data.get(ERROR_KEY) else {
        return Ok(data);
    };

    let kind = error
        .get("code")
        .cloned()
        .and_then(|code| serde_json::from_value::<ErrorKind>(code).ok())
        .unwrap_or(ErrorKind::Internal);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("remote error")
        .to_string();

    Err(SyncError::remote(kind, message))
}

/// Options for [`EventTransport::emit`](crate::transport::EventTransport::emit).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitOptions {
    pub for_peer: bool,
    pub broadcast: bool,
}

impl EmitOptions {
    pub fn broadcast() -> Self {
        EmitOptions {
            broadcast: true,
            ..Default::default()
        }
    }

    pub fn for_peer() -> Self {
        EmitOptions {
            for_peer: true,
            ..Default::default()
        }
    }
}

// =============================================================================
// Query Payloads
// =============================================================================

/// `{ "id": 7 }` for queries addressing a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdRequest {
    pub id: NodeId,
}

/// Reply to `fetchContent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentReply {
    pub id: NodeId,
    /// Base64 (standard alphabet) file bytes.
    pub content: String,
}

impl ContentReply {
    pub fn new(id: NodeId, bytes: &[u8]) -> Self {
        ContentReply {
            id,
            content: STANDARD.encode(bytes),
        }
    }

    pub fn into_bytes(self) -> SyncResult<Vec<u8>> {
        STANDARD
            .decode(self.content)
            .map_err(|e| SyncError::InvalidMessage(format!("content is not base64: {}", e)))
    }
}

/// Reply to `purgeNode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReply {
    pub purged: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingRequest {
    pub file_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSharingRequest {
    pub file_id: NodeId,
    pub shared: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Reply to `directCredential`: what a client needs to open the direct
/// channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectGrant {
    pub temporary_credential: String,
    #[serde(rename = "publicIP")]
    pub public_ip: String,
    pub port: u16,
    /// Base64 DER of the storage node's TLS certificate.
    pub server_public_key: String,
}

/// Reply to `listChildren`.
pub type ChildrenReply = Vec<FileNode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_wire_format() {
        let envelope = Envelope::query("listChildren", "q-1", json!({ "id": 0 }));
        let json: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "listChildren");
        assert_eq!(json["_queryId"], "q-1");
        assert!(json.get("forServer").is_none());
        assert!(json.get("broadcast").is_none());
    }

    #[test]
    fn test_classify() {
        let response = Envelope::response("q-1", json!(1)).classify();
        assert!(matches!(response, Inbound::Response { ref query_id, .. } if query_id == "q-1"));

        let query = Envelope::query("resolveNode", "q-2", Value::Null).classify();
        assert!(matches!(query, Inbound::Query { ref name, .. } if name == "resolveNode"));

        let event = Envelope::event("syncEvent", Value::Null).classify();
        assert!(matches!(event, Inbound::Event { .. }));
    }

    #[test]
    fn test_from_json_rejects_unroutable_envelopes() {
        assert!(Envelope::from_json("not json").is_err());
        assert!(Envelope::from_json(r#"{"event":"","data":null}"#).is_err());
        assert!(Envelope::from_json(r#"{"event":"queryResponse","data":1}"#).is_err());

        let ok = Envelope::from_json(r#"{"event":"syncEvent","forPeer":true}"#).unwrap();
        assert!(ok.is_for_peer());
        assert_eq!(ok.data, Value::Null);
    }

    #[test]
    fn test_error_response_round_trip() {
        let err = SyncError::remote(ErrorKind::Conflict, "'notes.txt' already exists");
        let envelope = Envelope::error_response("q-9", &err);
        assert_eq!(envelope.data["_error"]["code"], "CONFLICT");

        let decoded = decode_response(envelope.data).unwrap_err();
        assert_eq!(decoded.kind(), ErrorKind::Conflict);
        assert_eq!(decoded.to_string(), "'notes.txt' already exists");
    }

    #[test]
    fn test_unknown_error_code_is_internal() {
        let data = json!({ "_error": { "code": "SOMETHING_NEW", "message": "x" } });
        assert_eq!(decode_response(data).unwrap_err().kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_direct_grant_field_names() {
        let grant = DirectGrant {
            temporary_credential: "abc".into(),
            public_ip: "192.168.1.4".into(),
            port: 8443,
            server_public_key: "MII…".into(),
        };
        let json = serde_json::to_value(&grant).unwrap();
        assert_eq!(json["temporaryCredential"], "abc");
        assert_eq!(json["publicIP"], "192.168.1.4");
        assert_eq!(json["serverPublicKey"], "MII…");
    }

    #[test]
    fn test_mutation_channels() {
        assert_eq!(mutation_channel(&Mutation::Trash { id: 3 }), channels::TRASH_NODE);
        assert!(channels::STORAGE_QUERIES.contains(&channels::DIRECT_CREDENTIAL));
    }

    #[test]
    fn test_content_reply() {
        let reply = ContentReply::new(4, b"hello");
        assert_eq!(reply.content, "aGVsbG8=");
        assert_eq!(reply.into_bytes().unwrap(), b"hello");
    }
}
