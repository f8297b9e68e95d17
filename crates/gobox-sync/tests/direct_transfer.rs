//! Direct transfer against a running storage node: credentials handed out
//! over the relay, pinned TLS, and the fall back to the relay.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::net::UdpSocket;

use gobox_core::{ErrorKind, ROOT_ID};
use gobox_sync::direct::tls::pinned_client_config;
use gobox_sync::direct::{DirectChannel, TlsIdentity};
use gobox_sync::protocol::DirectGrant;
use gobox_sync::{channels, LocalChange};

use common::{eventually, raw_peer, read, Client, Storage, SETTLE};

fn pinned_http(grant: &DirectGrant) -> reqwest::Client {
    reqwest::Client::builder()
        .use_preconfigured_tls(pinned_client_config(&grant.server_public_key).unwrap())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

async fn seed(storage: &Storage, name: &str, content: &[u8]) -> gobox_core::FileNode {
    let path = storage.dir.path().join(name);
    tokio::fs::write(&path, content).await.unwrap();
    let engine = storage.node.engine();
    engine.local_change(LocalChange::created(&path)).await.unwrap();
    engine.wait_idle(SETTLE).await.unwrap();
    storage
        .node
        .committer()
        .store()
        .find_child(ROOT_ID, name)
        .await
        .unwrap()
        .unwrap()
}

// =============================================================================
// Credentials And Sessions
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn credential_from_relay_opens_one_session() {
    let storage = Storage::start(true).await;
    let node = seed(&storage, "report.txt", b"0123456789").await;
    let (handle, transport) = raw_peer(storage.hub()).await;

    let grant: DirectGrant = transport
        .request(channels::DIRECT_CREDENTIAL, json!({}))
        .await
        .unwrap();
    assert_eq!(grant.public_ip, "127.0.0.1");
    assert_eq!(grant.port, storage.node.direct_addr().unwrap().port());

    let http = pinned_http(&grant);
    let base = format!("https://{}:{}", grant.public_ip, grant.port);
    let credential = grant.temporary_credential.clone();
    let channel = DirectChannel::login(http.clone(), base.clone(), credential)
        .await
        .unwrap();

    let replay = DirectChannel::login(http, base, grant.temporary_credential)
        .await
        .unwrap_err();
    assert_eq!(replay.kind(), ErrorKind::Unauthorized);

    // The first session still works.
    assert_eq!(channel.download(node.id).await.unwrap(), b"0123456789");
    assert_eq!(channel.download_range(node.id, 2, Some(4)).await.unwrap(), b"234");
    assert_eq!(channel.download_range(node.id, 7, None).await.unwrap(), b"789");
    let preview = channel.preview(node.id).await.unwrap();
    assert!(preview.content_type.starts_with("text/plain"));
    assert_eq!(preview.body, b"0123456789");

    let missing = channel.download(9_999).await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);

    handle.shutdown();
    storage.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_grant_carries_a_fresh_credential() {
    let storage = Storage::start(true).await;
    let (handle, transport) = raw_peer(storage.hub()).await;

    let first: DirectGrant = transport
        .request(channels::DIRECT_CREDENTIAL, json!({}))
        .await
        .unwrap();
    let second: DirectGrant = transport
        .request(channels::DIRECT_CREDENTIAL, json!({}))
        .await
        .unwrap();
    assert_ne!(first.temporary_credential, second.temporary_credential);
    assert_eq!(first.server_public_key, second.server_public_key);

    // A certificate other than the server's own fails the pinned handshake.
    let stranger = TlsIdentity::generate(vec!["stranger".into()]).unwrap();
    let http = reqwest::Client::builder()
        .use_preconfigured_tls(pinned_client_config(&stranger.public_key()).unwrap())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let base = format!("https://{}:{}", first.public_ip, first.port);
    let err = DirectChannel::login(http, base, first.temporary_credential)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    handle.shutdown();
    storage.node.shutdown().await;
}

// =============================================================================
// Client Nodes
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_uploads_and_downloads_directly() {
    let storage = Storage::start(true).await;
    let discovery = storage.node.discovery_addr().unwrap();
    let client = Client::start_with(storage.hub(), |config| {
        config.direct.enabled = true;
        config.direct.probe_target = Some(discovery.to_string());
        config.direct.probe_timeout_ms = 2_000;
    })
    .await;

    let content = vec![7u8; 64 * 1024];
    let path = client.root().join("blob.bin");
    tokio::fs::write(&path, &content).await.unwrap();
    client
        .node
        .engine()
        .local_change(LocalChange::created(&path))
        .await
        .unwrap();

    let on_storage = &storage.dir.path().join("blob.bin");
    let expected = &content[..];
    assert!(
        eventually(SETTLE, move || async move {
            read(on_storage).await.as_deref() == Some(expected)
        })
        .await,
        "storage never received blob.bin"
    );

    let link = client.node.direct().unwrap();
    assert!(link.is_established().await, "upload did not go direct");

    let node = storage
        .node
        .committer()
        .store()
        .find_child(ROOT_ID, "blob.bin")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.download(node.id).await.unwrap(), content);

    client.node.shutdown().await;
    assert!(!link.is_established().await);
    storage.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_probe_falls_back_to_relay() {
    let storage = Storage::start(true).await;
    // Bound but never answers.
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = silent.local_addr().unwrap();
    let client = Client::start_with(storage.hub(), |config| {
        config.direct.enabled = true;
        config.direct.probe_target = Some(target.to_string());
        config.direct.probe_timeout_ms = 100;
    })
    .await;

    let path = client.root().join("fallback.txt");
    tokio::fs::write(&path, b"over the relay").await.unwrap();
    client
        .node
        .engine()
        .local_change(LocalChange::created(&path))
        .await
        .unwrap();

    let on_storage = &storage.dir.path().join("fallback.txt");
    assert!(
        eventually(SETTLE, move || async move {
            read(on_storage).await.as_deref() == Some(&b"over the relay"[..])
        })
        .await,
        "relay fallback never delivered the file"
    );

    let link = client.node.direct().unwrap();
    assert!(!link.is_established().await);
    let cooling = link.download(1).await.unwrap_err();
    assert_eq!(cooling.kind(), ErrorKind::Unavailable);

    // Content created on storage still arrives, fetched through the relay.
    let seeded = storage.dir.path().join("from-storage.txt");
    tokio::fs::write(&seeded, b"fetched via relay").await.unwrap();
    storage
        .node
        .engine()
        .local_change(LocalChange::created(&seeded))
        .await
        .unwrap();
    let mirrored = &client.root().join("from-storage.txt");
    assert!(
        eventually(SETTLE, move || async move {
            read(mirrored).await.as_deref() == Some(&b"fetched via relay"[..])
        })
        .await
    );
    assert!(client.node.status().await.last_error.is_none());

    drop(silent);
    client.node.shutdown().await;
    storage.node.shutdown().await;
}
