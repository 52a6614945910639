//! End-to-end scenarios: two in-memory source views against the same
//! store, a simulated peer, and a single contact item.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8Path;
use sync_api::models::{Priority, SessionState, SyncMode, TransportKind};
use sync_api::SyncStatus;

use syncd::backend::memory::{self, normalize, MemoryBackend, JOHN_DOE};
use syncd::backend::{BackendRegistry, SyncBackend};
use syncd::engine::adapter::SourceAdapter;
use syncd::engine::loopback::LoopbackPeer;
use syncd::engine::{DataOps, ItemKey};
use syncd::server::{RunOutcome, Server, ServerOptions};
use syncd::session::Session;
use syncd::sync_config::{ConfigTree, PeerConfig};
use syncd::tracker::{ChangeMode, ChangeTracker};
use syncd::transport::ChannelTransport;

fn make_server(dir: &Utf8Path) -> Arc<Server> {
    Server::new(
        ServerOptions {
            revision_granularity: Duration::ZERO,
            ..Default::default()
        },
        Arc::new(ConfigTree::new(dir.join("configs"))),
        Arc::new(BackendRegistry::default()),
    )
}

/// A peer config whose single `addressbook` source addresses the uniquely
/// named shared store `store_uri`.
fn seed_config(server: &Server, name: &str, store_uri: &str) {
    let mut config = PeerConfig::default();
    config.peer.insert("syncURL".into(), "http://peer/sync".into());
    let source = config.sources.entry("addressbook".into()).or_default();
    source.insert("type".into(), "memory:text/vcard:3.0".into());
    source.insert("uri".into(), store_uri.to_string());
    server.config_tree().save(name, &config).unwrap();
}

/// Wait until the scheduler hands the session the config lock.
async fn wait_active(session: &Arc<Session>) {
    let mut state = session.subscribe_state();
    while *state.borrow() == SessionState::Queued {
        state.changed().await.unwrap();
    }
}

/// Run one sync session against the shared peer through the live
/// scheduler.
async fn run_sync(
    server: &Arc<Server>,
    peer: &Arc<Mutex<LoopbackPeer>>,
    config: &str,
    mode: &str,
) -> SyncStatus {
    let session = server.start_session(config, vec![]).unwrap();
    wait_active(&session).await;

    let (session_end, peer_end) = ChannelTransport::pair();
    session.inject_transport(Box::new(session_end));
    let pump = tokio::spawn(LoopbackPeer::serve_shared(peer.clone(), peer_end));

    let mut done = session.subscribe_done();
    session.sync(mode, BTreeMap::new()).unwrap();
    let status = done.recv().await.unwrap();
    pump.abort();
    status
}

#[tokio::test]
async fn simple_insert_and_change_detection() {
    let dir = camino_tempfile::tempdir().unwrap();
    let store = memory::store_for(dir.path().as_str());

    // insert through source instance A's engine surface
    let mut a = SourceAdapter::open(
        "a",
        Box::new(MemoryBackend::with_store("a", store.clone())),
        &dir.path().join("a"),
        SyncMode::Slow,
        Duration::ZERO,
    )
    .unwrap();
    let put = a
        .insert_item_as_key(&ItemKey {
            luid: String::new(),
            data: JOHN_DOE.as_bytes().to_vec(),
        })
        .unwrap();

    // B sees exactly one new item
    let mut b_backend = MemoryBackend::with_store("b", store);
    b_backend.open().unwrap();
    let current = b_backend.list_all().unwrap();
    let mut b_tracker =
        ChangeTracker::load(dir.path().join("b.node"), Duration::ZERO).unwrap();
    let changes = b_tracker
        .detect_changes(ChangeMode::Full, current, false)
        .unwrap();
    assert_eq!(changes.added.len(), 1);
    assert_eq!(changes.updated.len(), 0);
    assert_eq!(changes.deleted.len(), 0);

    // and A's tracker now knows the returned luid
    let a_tracker =
        ChangeTracker::load(dir.path().join("a").join("change.node"), Duration::ZERO).unwrap();
    assert!(a_tracker.contains(&put.luid));
}

#[tokio::test]
async fn delete_all_then_refresh_from_server() {
    let dir = camino_tempfile::tempdir().unwrap();
    let server = make_server(dir.path());
    let store_uri = format!("{}-local", dir.path());
    seed_config(&server, "peer", &store_uri);
    let store = memory::store_for(&store_uri);

    let server_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    // one local item, mirrored to the peer by an initial sync
    {
        let mut seed = MemoryBackend::with_store("seed", store.clone());
        seed.open().unwrap();
        seed.insert(None, JOHN_DOE.as_bytes()).unwrap();
    }
    let peer = Arc::new(Mutex::new(LoopbackPeer::new(
        &dir.path().join("peer-state"),
        &["addressbook"],
    )));
    assert_eq!(
        run_sync(&server, &peer, "peer", "slow").await,
        SyncStatus::OK
    );
    assert_eq!(peer.lock().unwrap().store("addressbook").len(), 1);

    // delete locally, then refresh from the peer
    {
        let mut local = MemoryBackend::with_store("local", store.clone());
        local.open().unwrap();
        let all = local.list_all().unwrap();
        for luid in all.keys() {
            local.delete(luid).unwrap();
        }
    }
    assert_eq!(store.len(), 0);
    assert_eq!(
        run_sync(&server, &peer, "peer", "refresh-from-server").await,
        SyncStatus::OK
    );

    // the database contains exactly the item the peer had
    let mut check = MemoryBackend::with_store("check", store);
    check.open().unwrap();
    let all = check.list_all().unwrap();
    assert_eq!(all.len(), 1);
    let data = check.read(all.keys().next().unwrap()).unwrap();
    assert_eq!(normalize(&data), normalize(JOHN_DOE.as_bytes()));

    server.request_shutdown();
    server_loop.await.unwrap();
}

#[tokio::test]
async fn two_way_copy_through_the_peer() {
    let dir = camino_tempfile::tempdir().unwrap();
    let server = make_server(dir.path());
    let store_a = format!("{}-a", dir.path());
    let store_b = format!("{}-b", dir.path());
    seed_config(&server, "peer-a", &store_a);
    seed_config(&server, "peer-b", &store_b);

    let server_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    {
        let mut a = MemoryBackend::with_store("a", memory::store_for(&store_a));
        a.open().unwrap();
        a.insert(None, JOHN_DOE.as_bytes()).unwrap();
    }

    let peer = Arc::new(Mutex::new(LoopbackPeer::new(
        &dir.path().join("peer-state"),
        &["addressbook"],
    )));

    // A pushes its contact up, B picks it up
    assert_eq!(
        run_sync(&server, &peer, "peer-a", "two-way").await,
        SyncStatus::OK
    );
    assert_eq!(
        run_sync(&server, &peer, "peer-b", "two-way").await,
        SyncStatus::OK
    );

    let store_b = memory::store_for(&store_b);
    assert_eq!(store_b.len(), 1);
    let mut b = MemoryBackend::with_store("b", store_b);
    b.open().unwrap();
    let all = b.list_all().unwrap();
    let copied = b.read(all.keys().next().unwrap()).unwrap();
    // semantically the same contact, whitespace aside
    assert_eq!(normalize(&copied), normalize(JOHN_DOE.as_bytes()));

    server.request_shutdown();
    server_loop.await.unwrap();
}

#[tokio::test]
async fn abort_during_transport_wait() {
    let dir = camino_tempfile::tempdir().unwrap();
    let server = make_server(dir.path());
    let store_uri = format!("{}-local", dir.path());
    seed_config(&server, "peer", &store_uri);
    let store = memory::store_for(&store_uri);

    let server_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let session = server.start_session("peer", vec![]).unwrap();
    wait_active(&session).await;

    // a peer that never answers keeps the engine inside Transport::wait
    let (session_end, _peer_end) = ChannelTransport::pair();
    session.inject_transport(Box::new(session_end));
    let mut done = session.subscribe_done();
    session.sync("slow", BTreeMap::new()).unwrap();

    // let the engine reach the wait, then abort
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.abort().unwrap();

    let status = done.recv().await.unwrap();
    assert_eq!(status, SyncStatus::USER_ABORT);
    let (state, error, _) = session.get_status();
    assert_eq!(state, "done");
    assert_eq!(error, SyncStatus::USER_ABORT.0);
    // nothing was added or modified locally
    assert_eq!(store.len(), 0);

    server.request_shutdown();
    server_loop.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn auto_sync_respects_presence_delay() {
    let dir = camino_tempfile::tempdir().unwrap();
    let server = make_server(dir.path());

    let mut config = PeerConfig::default();
    config.peer.insert("syncURL".into(), "http://peer/sync".into());
    config.peer.insert("autoSync".into(), "1".into());
    config.peer.insert("autoSyncInterval".into(), "60".into());
    config.peer.insert("autoSyncDelay".into(), "30".into());
    config.sources.entry("addressbook".into()).or_default();
    server.config_tree().save("phone", &config).unwrap();

    let auto_sync = server.auto_sync();
    auto_sync.init_config("phone");

    // the task starts with "last sync = now"; move past the interval, then
    // bring HTTP up at t0
    server.presence().register_network_provider();
    tokio::time::advance(Duration::from_secs(61)).await;
    server.presence().update(TransportKind::Http, true);

    tokio::time::advance(Duration::from_secs(10)).await;
    auto_sync.schedule("test, t0+10").await;
    assert!(
        server.get_sessions().is_empty(),
        "no session before the presence delay has passed"
    );

    tokio::time::advance(Duration::from_secs(20)).await;
    auto_sync.schedule("test, t0+30").await;
    let sessions = server.get_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].priority(), Priority::AUTOSYNC);
}

#[tokio::test(start_paused = true)]
async fn upgrade_restarts_when_auto_sync_is_on() {
    let dir = camino_tempfile::tempdir().unwrap();
    let server = make_server(dir.path());

    // one eligible auto-sync task makes re-exec preferable over exit
    let mut config = PeerConfig::default();
    config.peer.insert("syncURL".into(), "http://peer/sync".into());
    config.peer.insert("autoSync".into(), "1".into());
    config.peer.insert("autoSyncInterval".into(), "3600".into());
    config.sources.entry("addressbook".into()).or_default();
    server.config_tree().save("phone", &config).unwrap();
    server.auto_sync().init_config("phone");

    let server_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    tokio::task::yield_now().await;

    // a mapped file was touched
    server.file_modified();
    tokio::time::advance(Duration::from_secs(11)).await;

    let outcome = server_loop.await.unwrap();
    assert_eq!(outcome, RunOutcome::Restart);
    // no new session started during the quiescence window
    assert!(server.get_sessions().is_empty());
}

#[tokio::test]
async fn restore_through_a_session() {
    use syncd::item_cache::ItemCache;

    let dir = camino_tempfile::tempdir().unwrap();
    let server = make_server(dir.path());
    let store_uri = format!("{}-local", dir.path());
    seed_config(&server, "peer", &store_uri);
    let store = memory::store_for(&store_uri);

    // a backup of the state to return to
    let backup_dir = dir.path().join("backup");
    let snapshot_dir = backup_dir.join("addressbook").join("before");
    let mut cache = ItemCache::init(None, &snapshot_dir).unwrap();
    cache
        .backup_item(JOHN_DOE.as_bytes(), "l1", "r1")
        .unwrap();
    cache.finalize().unwrap();

    let server_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let session = server.start_session("peer", vec![]).unwrap();
    wait_active(&session).await;
    let mut done = session.subscribe_done();
    session
        .restore(backup_dir.as_str(), true, vec![])
        .unwrap();
    assert_eq!(done.recv().await.unwrap(), SyncStatus::OK);

    assert_eq!(store.len(), 1);
    let mut check = MemoryBackend::with_store("check", store);
    check.open().unwrap();
    assert_eq!(check.read("l1").unwrap(), JOHN_DOE.as_bytes());

    server.request_shutdown();
    server_loop.await.unwrap();
}

#[tokio::test]
async fn plain_shutdown_exits_without_auto_sync() {
    let dir = camino_tempfile::tempdir().unwrap();
    let server = make_server(dir.path());
    let server_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    tokio::task::yield_now().await;
    server.request_shutdown();
    assert_eq!(server_loop.await.unwrap(), RunOutcome::Exit);
}
