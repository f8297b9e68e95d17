//! # Handler Registry
//!
//! Event and query handlers, registered explicitly at startup and verified
//! against the set of names the node is expected to serve.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Handler Registration                                │
//! │                                                                         │
//! │  RegistryBuilder::new()                                                │
//! │       │  .on_query("createNode", …)                                    │
//! │       │  .on_typed_query("listChildren", …)                            │
//! │       │  .on_event("syncEvent", …)                                     │
//! │       ▼                                                                 │
//! │  build(&Expected { events, queries })                                  │
//! │       │  ✗ name registered twice         → DuplicateHandler            │
//! │       │  ✗ name registered, not expected → DuplicateHandler            │
//! │       │  ✗ expected name has no handler  → MissingHandler              │
//! │       ▼                                                                 │
//! │  HandlerRegistry (immutable, shared by every connection)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::protocol::QUERY_RESPONSE;

/// Handler for a fire-and-forget event.
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, SyncResult<()>> + Send + Sync>;

/// Handler for a query; its value becomes the response data.
pub type QueryHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, SyncResult<Value>> + Send + Sync>;

/// Names a registry must serve, each exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Expected<'a> {
    pub events: &'a [&'a str],
    pub queries: &'a [&'a str],
}

// =============================================================================
// Builder
// =============================================================================

/// Collects handlers before verification.
#[derive(Default)]
pub struct RegistryBuilder {
    events: Vec<(String, EventHandler)>,
    queries: Vec<(String, QueryHandler)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |data| handler(data).boxed());
        self.events.push((name.to_string(), handler));
        self
    }

    pub fn on_query<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<Value>> + Send + 'static,
    {
        let handler: QueryHandler = Arc::new(move |data| handler(data).boxed());
        self.queries.push((name.to_string(), handler));
        self
    }

    /// Registers an event handler that receives its payload already decoded.
    ///
    /// A payload that does not decode is reported as `InvalidMessage`.
    pub fn on_typed_event<T, F, Fut>(self, name: &str, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_event(name, move |data| {
            let handler = handler.clone();
            async move { handler(decode_payload(data)?).await }
        })
    }

    /// Registers a query handler with decoded request and serialized reply.
    pub fn on_typed_query<Req, Resp, F, Fut>(self, name: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<Resp>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_query(name, move |data| {
            let handler = handler.clone();
            async move {
                let reply = handler(decode_payload(data)?).await?;
                Ok(serde_json::to_value(reply)?)
            }
        })
    }

    /// Verifies the handler set and freezes it.
    pub fn build(self, expected: &Expected<'_>) -> SyncResult<HandlerRegistry> {
        let mut seen = HashSet::new();
        for name in self
            .events
            .iter()
            .map(|(n, _)| n)
            .chain(self.queries.iter().map(|(n, _)| n))
        {
            if name == QUERY_RESPONSE || !seen.insert(name.clone()) {
                return Err(SyncError::DuplicateHandler(name.clone()));
            }
        }

        for (name, _) in &self.events {
            if !expected.events.contains(&name.as_str()) {
                return Err(SyncError::DuplicateHandler(name.clone()));
            }
        }
        for (name, _) in &self.queries {
            if !expected.queries.contains(&name.as_str()) {
                return Err(SyncError::DuplicateHandler(name.clone()));
            }
        }

        let events: HashMap<String, EventHandler> = self.events.into_iter().collect();
        let queries: HashMap<String, QueryHandler> = self.queries.into_iter().collect();

        for name in expected.events {
            if !events.contains_key(*name) {
                return Err(SyncError::MissingHandler(name.to_string()));
            }
        }
        for name in expected.queries {
            if !queries.contains_key(*name) {
                return Err(SyncError::MissingHandler(name.to_string()));
            }
        }

        Ok(HandlerRegistry { events, queries })
    }
}

fn decode_payload<T: DeserializeOwned>(data: Value) -> SyncResult<T> {
    serde_json::from_value(data).map_err(|e| SyncError::InvalidMessage(e.to_string()))
}

// =============================================================================
// Registry
// =============================================================================

/// Verified, immutable handler tables.
#[derive(Default)]
pub struct HandlerRegistry {
    events: HashMap<String, EventHandler>,
    queries: HashMap<String, QueryHandler>,
}

impl HandlerRegistry {
    /// A registry with no handlers, for links that only issue queries.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn event(&self, name: &str) -> Option<&EventHandler> {
        self.events.get(name)
    }

    pub fn query(&self, name: &str) -> Option<&QueryHandler> {
        self.queries.get(name)
    }

    pub fn len(&self) -> usize {
        self.events.len() + self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut events: Vec<_> = self.events.keys().collect();
        let mut queries: Vec<_> = self.queries.keys().collect();
        events.sort();
        queries.sort();
        f.debug_struct("HandlerRegistry")
            .field("events", &events)
            .field("queries", &queries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const EXPECTED: Expected<'static> = Expected {
        events: &["syncEvent"],
        queries: &["listChildren"],
    };

    fn complete() -> RegistryBuilder {
        RegistryBuilder::new()
            .on_event("syncEvent", |_| async { Ok(()) })
            .on_query("listChildren", |data| async move { Ok(data) })
    }

    #[tokio::test]
    async fn test_build_complete_registry() {
        let registry = complete().build(&EXPECTED).unwrap();
        assert_eq!(registry.len(), 2);

        let handler = registry.query("listChildren").unwrap();
        assert_eq!(handler(json!({ "id": 0 })).await.unwrap(), json!({ "id": 0 }));
        assert!(registry.query("syncEvent").is_none());
    }

    #[test]
    fn test_missing_handler_is_rejected() {
        let err = RegistryBuilder::new()
            .on_event("syncEvent", |_| async { Ok(()) })
            .build(&EXPECTED)
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingHandler(name) if name == "listChildren"));
    }

    #[test]
    fn test_duplicate_handler_is_rejected() {
        let err = complete()
            .on_query("listChildren", |data| async move { Ok(data) })
            .build(&EXPECTED)
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateHandler(name) if name == "listChildren"));
    }

    #[test]
    fn test_unexpected_and_reserved_names_are_rejected() {
        let err = complete()
            .on_event("somethingElse", |_| async { Ok(()) })
            .build(&EXPECTED)
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateHandler(_)));

        let err = complete()
            .on_query(QUERY_RESPONSE, |data| async move { Ok(data) })
            .build(&EXPECTED)
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateHandler(_)));
    }

    #[tokio::test]
    async fn test_typed_query_rejects_bad_payload() {
        #[derive(serde::Deserialize)]
        struct Req {
            id: u64,
        }

        let registry = RegistryBuilder::new()
            .on_typed_query("listChildren", |req: Req| async move { Ok(req.id + 1) })
            .on_event("syncEvent", |_| async { Ok(()) })
            .build(&EXPECTED)
            .unwrap();

        let handler = registry.query("listChildren").unwrap();
        assert_eq!(handler(json!({ "id": 4 })).await.unwrap(), json!(5));
        let err = handler(json!({ "nope": true })).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidMessage(_)));
    }
}
