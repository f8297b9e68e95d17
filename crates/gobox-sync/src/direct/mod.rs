//! # Direct Transfer
//!
//! Optional client ↔ storage channel for bulk content, bypassing the relay.
//!
//! ## Negotiation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Direct Transfer Negotiation                      │
//! │                                                                         │
//! │  CLIENT                                   STORAGE NODE                  │
//! │  ──────                                   ────────────                  │
//! │  1. probe "GOBOX_DIRECT" ═══════UDP═════▶ DiscoveryResponder            │
//! │     ◀════════ "GOBOX_DIRECT_PORT:<p>"                                   │
//! │  2. directCredential ─────────relay─────▶ CredentialStore::issue        │
//! │     ◀── { temporaryCredential, publicIP, port, serverPublicKey }        │
//! │  3. POST /directLogin ───HTTPS(pinned)──▶ redeem (single use)           │
//! │     ◀── { success, token } | Set-Cookie   SessionSigner::issue          │
//! │  4. GET /file, POST /upload ────────────▶ session middleware → handler  │
//! │                                                                         │
//! │  Any failure in 1-3 → Unavailable → the caller uses the relay.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod credentials;
pub mod preview;
pub mod server;
pub mod session;
pub mod tls;

use serde::{Deserialize, Serialize};

pub use client::{DirectChannel, DirectLink, DirectNegotiator};
pub use credentials::CredentialStore;
pub use preview::{Preview, PreviewGenerator, PreviewRegistry};
pub use server::{DirectServer, DirectServerHandle, DirectState};
pub use session::{SessionClaims, SessionSigner};
pub use tls::TlsIdentity;

/// Route redeeming a temporary credential.
pub const LOGIN_PATH: &str = "/directLogin";

/// Route serving file content, ranges, previews and directory archives.
pub const FILE_PATH: &str = "/file";

/// Route accepting raw file content.
pub const UPLOAD_PATH: &str = "/upload";

/// `POST /directLogin` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub temporary_credential: String,
    /// Deliver the session token as a cookie instead of in the body.
    #[serde(default)]
    pub cookie: bool,
}

/// `POST /directLogin` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}
