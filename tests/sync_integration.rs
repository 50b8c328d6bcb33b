//! End-to-end tests for two repos syncing over in-memory transports.
//!
//! These start two real repos joined by a `MemoryNetworkAdapter` pair and
//! verify the full pipeline: discovery, per-document sync, unavailability,
//! reconnect catch-up, and ephemeral dedupe.

use automerge::transaction::Transactable;
use automerge::{ReadDoc, ROOT};
use docsync::{
    DocumentId, DummyNetworkAdapter, HandleEvent, HandleState, InMemoryStorageAdapter,
    MemoryNetworkAdapter, NetworkAdapter, PeerId, PeerMetadata, Repo, RepoConfig, RepoMessage,
};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Two repos with storage, joined by an in-memory pair. Returns the
/// adapters too so tests can cut and restore the link.
async fn connected_repos() -> (Repo, Repo, MemoryNetworkAdapter, MemoryNetworkAdapter) {
    let (left, right) = MemoryNetworkAdapter::pair();
    let alice = Repo::new(RepoConfig {
        peer_id: Some(PeerId::from("alice")),
        storage: Some(Arc::new(InMemoryStorageAdapter::new())),
        network: vec![Arc::new(left.clone())],
        ..RepoConfig::for_testing()
    })
    .await
    .unwrap();
    let bob = Repo::new(RepoConfig {
        peer_id: Some(PeerId::from("bob")),
        storage: Some(Arc::new(InMemoryStorageAdapter::new())),
        network: vec![Arc::new(right.clone())],
        ..RepoConfig::for_testing()
    })
    .await
    .unwrap();
    (alice, bob, left, right)
}

/// Poll until both handles are READY with equal heads.
async fn await_convergence(a: &docsync::DocHandle, b: &docsync::DocHandle) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let (Ok(ha), Ok(hb)) = (a.heads(), b.heads()) {
            if ha == hb {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "no convergence: {:?} vs {:?}",
                a.heads().ok(),
                b.heads().ok()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_two_peer_sync() {
    let (alice, bob, _left, _right) = connected_repos().await;

    let ha = alice.create().await.unwrap();
    ha.change(|doc| {
        doc.put(ROOT, "x", 0).unwrap();
    })
    .unwrap();

    let hb = bob.find(&ha.url()).await.unwrap();
    let doc = timeout(Duration::from_secs(5), hb.doc()).await.unwrap().unwrap();

    await_convergence(&ha, &hb).await;
    let (value, _) = doc.get(ROOT, "x").unwrap().unwrap();
    assert_eq!(value.to_i64(), Some(0));
}

#[tokio::test]
async fn test_sync_flows_both_directions() {
    let (alice, bob, _left, _right) = connected_repos().await;

    let ha = alice.create().await.unwrap();
    ha.change(|doc| {
        doc.put(ROOT, "from_alice", 1).unwrap();
    })
    .unwrap();
    let hb = bob.find(&ha.url()).await.unwrap();
    timeout(Duration::from_secs(5), hb.doc()).await.unwrap().unwrap();

    // Bob edits too; both converge on the union.
    hb.change(|doc| {
        doc.put(ROOT, "from_bob", 2).unwrap();
    })
    .unwrap();

    await_convergence(&ha, &hb).await;
    let doc = ha.doc_sync().unwrap();
    assert!(doc.get(ROOT, "from_alice").unwrap().is_some());
    assert!(doc.get(ROOT, "from_bob").unwrap().is_some());
}

#[tokio::test]
async fn test_unavailable_document_times_out() {
    let repo = Repo::new(RepoConfig {
        network: vec![Arc::new(DummyNetworkAdapter::new(true))],
        handle_timeout: Some(Duration::from_millis(50)),
        ..RepoConfig::for_testing()
    })
    .await
    .unwrap();

    let handle = repo.find_by_id(DocumentId::random()).await;
    let mut events = handle.subscribe();

    timeout(
        Duration::from_millis(500),
        handle.await_state(&[HandleState::Unavailable]),
    )
    .await
    .expect("handle never became unavailable")
    .unwrap();

    loop {
        match timeout(Duration::from_millis(500), events.recv()).await.unwrap().unwrap() {
            HandleEvent::Unavailable => break,
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_cached_unavailable_handle_reannounces_on_find() {
    let repo = Repo::new(RepoConfig {
        network: vec![Arc::new(DummyNetworkAdapter::new(true))],
        handle_timeout: Some(Duration::from_millis(30)),
        ..RepoConfig::for_testing()
    })
    .await
    .unwrap();

    let id = DocumentId::random();
    let first = repo.find_by_id(id).await;
    first
        .await_state(&[HandleState::Unavailable])
        .await
        .unwrap();

    // A second find returns the cached handle and re-emits unavailable on
    // a later turn, so the new caller can hear it.
    let second = repo.find_by_id(id).await;
    let mut events = second.subscribe();
    loop {
        match timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap() {
            HandleEvent::Unavailable => break,
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_reconnect_catches_up() {
    let (alice, bob, _left, right) = connected_repos().await;

    let ha = alice.create().await.unwrap();
    ha.change(|doc| {
        doc.put(ROOT, "round", 0).unwrap();
    })
    .unwrap();
    let hb = bob.find(&ha.url()).await.unwrap();
    timeout(Duration::from_secs(5), hb.doc()).await.unwrap().unwrap();
    await_convergence(&ha, &hb).await;

    // Cut bob's link and keep editing on alice's side.
    right.disconnect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    for i in 1..=10 {
        ha.change(|doc| {
            doc.put(ROOT, "round", i).unwrap();
        })
        .unwrap();
    }
    assert_ne!(ha.heads().unwrap(), hb.heads().unwrap());

    // Reconnect with the same peer identity; sync resumes without bob
    // ever leaving READY (no fresh request round).
    let bob_metadata = PeerMetadata {
        storage_id: bob.storage_id().await,
        is_ephemeral: false,
    };
    right.connect(PeerId::from("bob"), bob_metadata).await;

    await_convergence(&ha, &hb).await;
    assert!(hb.is_ready());
    let doc = hb.doc_sync().unwrap();
    let (value, _) = doc.get(ROOT, "round").unwrap().unwrap();
    assert_eq!(value.to_i64(), Some(10));
}

#[tokio::test]
async fn test_ephemeral_broadcast_delivered() {
    let (alice, bob, _left, _right) = connected_repos().await;

    let ha = alice.create().await.unwrap();
    ha.change(|doc| {
        doc.put(ROOT, "x", 1).unwrap();
    })
    .unwrap();
    let hb = bob.find(&ha.url()).await.unwrap();
    timeout(Duration::from_secs(5), hb.doc()).await.unwrap().unwrap();
    await_convergence(&ha, &hb).await;

    let mut events = hb.subscribe();
    ha.broadcast(vec![0xca, 0xfe]).unwrap();

    loop {
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap() {
            HandleEvent::EphemeralMessage { sender_id, data } => {
                assert_eq!(sender_id.as_str(), "alice");
                assert_eq!(data, vec![0xca, 0xfe]);
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_ephemeral_dedupe_under_reordering() {
    // A repo on the left half; the test drives the right half by hand so
    // deliveries can be reordered.
    let (left, right) = MemoryNetworkAdapter::pair();
    let repo = Repo::new(RepoConfig {
        peer_id: Some(PeerId::from("bob")),
        network: vec![Arc::new(left)],
        ..RepoConfig::for_testing()
    })
    .await
    .unwrap();
    right
        .connect(PeerId::from("alice"), PeerMetadata::default())
        .await;

    let handle = repo.create().await.unwrap();
    let mut events = handle.subscribe();

    // Counts 1,2,3 delivered in the order 3,1,2: only 3 may get through.
    for count in [3u32, 1, 2] {
        right
            .send(RepoMessage::Ephemeral {
                sender_id: PeerId::from("alice"),
                target_id: PeerId::from("bob"),
                document_id: handle.document_id(),
                count,
                session_id: "session-1".into(),
                data: vec![count as u8],
            })
            .await
            .unwrap();
    }

    let mut delivered = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
    while tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(100), events.recv()).await {
            Ok(Ok(HandleEvent::EphemeralMessage { data, .. })) => delivered.push(data),
            _ => {}
        }
    }
    assert_eq!(delivered, vec![vec![3u8]], "exactly one delivery, for count 3");

    // A higher count from the same session still gets through.
    right
        .send(RepoMessage::Ephemeral {
            sender_id: PeerId::from("alice"),
            target_id: PeerId::from("bob"),
            document_id: handle.document_id(),
            count: 4,
            session_id: "session-1".into(),
            data: vec![4],
        })
        .await
        .unwrap();
    loop {
        match timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap() {
            HandleEvent::EphemeralMessage { data, .. } => {
                assert_eq!(data, vec![4]);
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_share_policy_gates_announcement_not_requests() {
    struct ShareNothing;

    #[async_trait::async_trait]
    impl docsync::SharePolicy for ShareNothing {
        async fn should_share(
            &self,
            _peer: &PeerId,
            _document: Option<&DocumentId>,
        ) -> bool {
            false
        }
    }

    let (left, right) = MemoryNetworkAdapter::pair();
    let alice = Repo::new(RepoConfig {
        peer_id: Some(PeerId::from("alice")),
        network: vec![Arc::new(left)],
        share_policy: Arc::new(ShareNothing),
        ..RepoConfig::for_testing()
    })
    .await
    .unwrap();
    let bob = Repo::new(RepoConfig {
        peer_id: Some(PeerId::from("bob")),
        network: vec![Arc::new(right)],
        ..RepoConfig::for_testing()
    })
    .await
    .unwrap();

    let ha = alice.create().await.unwrap();
    ha.change(|doc| {
        doc.put(ROOT, "quiet", 1).unwrap();
    })
    .unwrap();

    // With the policy refusing, alice never announces: bob hears nothing
    // spontaneously.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(bob.handles().is_empty(), "document must not be announced");

    // The policy is not access control: an explicit request by URL still
    // gets the document.
    let hb = bob.find(&ha.url()).await.unwrap();
    timeout(Duration::from_secs(5), hb.doc()).await.unwrap().unwrap();
    await_convergence(&ha, &hb).await;
}

#[tokio::test]
async fn test_three_documents_sync_independently() {
    let (alice, bob, _left, _right) = connected_repos().await;

    let mut pairs = Vec::new();
    for i in 0..3 {
        let ha = alice.create().await.unwrap();
        ha.change(|doc| {
            doc.put(ROOT, "index", i).unwrap();
        })
        .unwrap();
        let hb = bob.find(&ha.url()).await.unwrap();
        pairs.push((ha, hb));
    }

    for (ha, hb) in &pairs {
        timeout(Duration::from_secs(5), hb.doc()).await.unwrap().unwrap();
        await_convergence(ha, hb).await;
    }

    for (i, (_, hb)) in pairs.iter().enumerate() {
        let doc = hb.doc_sync().unwrap();
        let (value, _) = doc.get(ROOT, "index").unwrap().unwrap();
        assert_eq!(value.to_i64(), Some(i as i64));
    }
}
