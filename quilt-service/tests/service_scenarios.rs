//! End-to-end scenarios against a full service context with the
//! in-memory channel transport.

use quilt_model::{AppId, DataDir, MockClock, Options, SecurityLevel, Status, StoreId, StoreKind, StoreMeta, UserId};
use quilt_service::{
    AccountEvent, BackupSource, ServiceConfig, ServiceContext, StaticAccountDelegate,
};
use quilt_store::SingleStore;
use quilt_sync::sim::ChannelNetwork;
use quilt_sync::Transport;
use std::sync::Arc;
use std::time::Duration;

const CALLER_UID: u32 = 10_001;

struct Fixture {
    _dir: tempfile::TempDir,
    data_dir: DataDir,
    network: ChannelNetwork,
    account: Arc<StaticAccountDelegate>,
    clock: Arc<MockClock>,
    ctx: Arc<ServiceContext>,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = DataDir::new(dir.path());
    let network = ChannelNetwork::new();
    let transport = Arc::new(network.register("local"));
    let account = Arc::new(StaticAccountDelegate::new());
    let clock = Arc::new(MockClock::new(1_700_000_000_000));

    let mut config = ServiceConfig::new(data_dir.clone(), transport);
    config.account = account.clone();
    config.clock = clock.clone();
    let ctx = ServiceContext::initialize(config).await.unwrap();

    Fixture {
        _dir: dir,
        data_dir,
        network,
        account,
        clock,
        ctx,
    }
}

fn app(name: &str) -> AppId {
    AppId::new(name)
}

fn store(name: &str) -> StoreId {
    StoreId::new(name)
}

fn encrypted_options() -> Options {
    Options {
        encrypt: true,
        ..Default::default()
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_s1_new_encrypted_store() {
    let fx = fixture().await;
    let service = fx.ctx.service();

    let opened = service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &encrypted_options())
        .unwrap();
    assert!(!opened.recovered);

    // The handle is a usable store.
    let kv = opened.handle.single().unwrap();
    kv.put(b"k", b"v").unwrap();
    assert_eq!(kv.get(b"k").unwrap(), Some(b"v".to_vec()));

    // Secret generated: both persisted copies exist.
    let secrets = fx.ctx.meta().scan(b"SecretKey:").unwrap();
    assert_eq!(secrets.len(), 1);

    // Meta record written.
    let metas = fx.ctx.meta().scan(b"StoreMeta:").unwrap();
    assert_eq!(metas.len(), 1);
    let record = StoreMeta::from_json(&metas[0].1).unwrap();
    assert!(record.encrypted);
    assert_eq!(record.app_type, "harmony");
    // 32-byte hash, hex encoded.
    assert_eq!(record.device_id.as_str().len(), 64);

    // Re-opening plaintext over the encrypted store is rejected.
    let err = service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &Options::default())
        .unwrap_err();
    assert_eq!(err, Status::InvalidArgument);
}

#[tokio::test]
async fn test_s2_corruption_recovers_from_backup() {
    let fx = fixture().await;
    let service = fx.ctx.service();
    let options = Options {
        backup: true,
        ..Default::default()
    };

    let opened = service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &options)
        .unwrap();
    for i in 0..5u8 {
        opened.handle.single().unwrap().put(&[i], &[i]).unwrap();
    }
    drop(opened);

    // Snapshot, then tear the handle down so the file can be damaged.
    fx.ctx.registry().run_backup_pass();
    service
        .close_kv_store(CALLER_UID, &app("app.a"), &store("s1"))
        .unwrap();

    let db_path = SingleStore::db_path(&fx.data_dir.store_dir(
        SecurityLevel::De,
        &UserId::new("0"),
        &app("app.a"),
        &store("s1"),
    ));
    std::fs::write(&db_path, b"corrupted".repeat(64)).unwrap();

    let reopened = service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &options)
        .unwrap();
    assert!(reopened.recovered);
    assert_eq!(reopened.handle.single().unwrap().count().unwrap(), 5);
}

#[tokio::test]
async fn test_corruption_without_backup_is_crypt_error() {
    let fx = fixture().await;
    let service = fx.ctx.service();

    service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &Options::default())
        .unwrap();
    service
        .close_kv_store(CALLER_UID, &app("app.a"), &store("s1"))
        .unwrap();

    let db_path = SingleStore::db_path(&fx.data_dir.store_dir(
        SecurityLevel::De,
        &UserId::new("0"),
        &app("app.a"),
        &store("s1"),
    ));
    std::fs::write(&db_path, b"corrupted".repeat(64)).unwrap();

    let err = service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &Options::default())
        .unwrap_err();
    assert_eq!(err, Status::CryptError);
}

#[tokio::test]
async fn test_s3_peer_delete_propagates_via_dirty_meta() {
    let fx = fixture().await;
    let service = fx.ctx.service();

    service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &Options::default())
        .unwrap();
    let registry = fx.ctx.registry();
    assert!(registry.is_store_opened(&UserId::new("0"), &app("app.a"), &store("s1")));

    // A peer marks the replica dirty and updates the meta record.
    let metas = fx.ctx.meta().scan(b"StoreMeta:").unwrap();
    let (key, value) = metas.into_iter().next().unwrap();
    let mut record = StoreMeta::from_json(&value).unwrap();
    record.is_dirty = true;
    fx.ctx.meta().put(&key, &record.to_json()).unwrap();

    wait_until(|| !registry.is_store_opened(&UserId::new("0"), &app("app.a"), &store("s1"))).await;
    wait_until(|| fx.ctx.meta().scan(b"StoreMeta:").unwrap().is_empty()).await;

    let store_dir = fx.data_dir.store_dir(
        SecurityLevel::De,
        &UserId::new("0"),
        &app("app.a"),
        &store("s1"),
    );
    assert!(!store_dir.exists());
}

#[tokio::test]
async fn test_s5_client_death_closes_everything() {
    let fx = fixture().await;
    let service = fx.ctx.service();

    service
        .register_client_death_observer(&app("app.b"), CALLER_UID)
        .unwrap();
    assert!(fx.ctx.death_registry().has_observer(&app("app.b")));
    assert_eq!(fx.ctx.death_registry().permission_listener_count(), 1);

    // Duplicate registration rejected.
    assert_eq!(
        service
            .register_client_death_observer(&app("app.b"), CALLER_UID)
            .unwrap_err(),
        Status::Error
    );

    service
        .get_single_kv_store(CALLER_UID, &app("app.b"), &store("s1"), &Options::default())
        .unwrap();
    service
        .get_single_kv_store(CALLER_UID, &app("app.b"), &store("s2"), &Options::default())
        .unwrap();

    service.notify_client_death(&app("app.b"));

    let registry = fx.ctx.registry();
    assert!(!registry.is_store_opened(&UserId::new("0"), &app("app.b"), &store("s1")));
    assert!(!registry.is_store_opened(&UserId::new("0"), &app("app.b"), &store("s2")));
    assert!(!fx.ctx.death_registry().has_observer(&app("app.b")));
    assert_eq!(fx.ctx.death_registry().permission_listener_count(), 0);
}

#[tokio::test]
async fn test_refcounted_close_leaves_bucket_clean() {
    let fx = fixture().await;
    let service = fx.ctx.service();
    let registry = fx.ctx.registry();

    let first = service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &Options::default())
        .unwrap();
    let second = service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &Options::default())
        .unwrap();
    // Concurrent openers share the winner's handle.
    assert!(Arc::ptr_eq(&first.handle, &second.handle));
    assert_eq!(first.handle.open_count(), 2);

    service
        .close_kv_store(CALLER_UID, &app("app.a"), &store("s1"))
        .unwrap();
    assert!(registry.is_store_opened(&UserId::new("0"), &app("app.a"), &store("s1")));

    service
        .close_kv_store(CALLER_UID, &app("app.a"), &store("s1"))
        .unwrap();
    assert!(!registry.is_store_opened(&UserId::new("0"), &app("app.a"), &store("s1")));
    assert_eq!(first.handle.open_count(), 0);

    assert_eq!(
        service
            .close_kv_store(CALLER_UID, &app("app.a"), &store("s1"))
            .unwrap_err(),
        Status::StoreNotOpen
    );
}

#[tokio::test]
async fn test_outdated_secret_rotates_on_open() {
    let fx = fixture().await;
    let service = fx.ctx.service();

    service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &encrypted_options())
        .unwrap();
    let before = fx.ctx.meta().scan(b"SecretKey:").unwrap();
    service
        .close_kv_store(CALLER_UID, &app("app.a"), &store("s1"))
        .unwrap();

    // One year later the open rotates the secret in place.
    fx.clock.advance(quilt_keys::OUTDATED_AFTER_MS + 1);
    let reopened = service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &encrypted_options())
        .unwrap();
    let kv = reopened.handle.single().unwrap();
    kv.put(b"k", b"v").unwrap();
    assert_eq!(kv.get(b"k").unwrap(), Some(b"v".to_vec()));

    let after = fx.ctx.meta().scan(b"SecretKey:").unwrap();
    assert_eq!(after.len(), 1);
    assert_ne!(before[0].1, after[0].1, "sealed secret must change");
}

#[tokio::test]
async fn test_delete_store_removes_every_trace() {
    let fx = fixture().await;
    let service = fx.ctx.service();
    let options = Options {
        encrypt: true,
        backup: true,
        ..Default::default()
    };

    service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &options)
        .unwrap();
    fx.ctx.registry().run_backup_pass();

    service
        .delete_kv_store(CALLER_UID, &app("app.a"), &store("s1"))
        .unwrap();

    assert!(fx.ctx.meta().scan(b"StoreMeta:").unwrap().is_empty());
    assert!(fx.ctx.meta().scan(b"SecretKey:").unwrap().is_empty());
    let store_dir = fx.data_dir.store_dir(
        SecurityLevel::De,
        &UserId::new("0"),
        &app("app.a"),
        &store("s1"),
    );
    assert!(!store_dir.exists());

    // A plaintext create now succeeds: no stale secret survives.
    service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &Options::default())
        .unwrap();
}

#[tokio::test]
async fn test_store_id_enumeration() {
    let fx = fixture().await;
    let service = fx.ctx.service();

    for name in ["s1", "s2", "s3"] {
        service
            .get_single_kv_store(CALLER_UID, &app("app.a"), &store(name), &Options::default())
            .unwrap();
    }
    service
        .get_single_kv_store(CALLER_UID, &app("app.other"), &store("sx"), &Options::default())
        .unwrap();

    let mut ids: Vec<String> = service
        .get_all_kv_store_id(CALLER_UID, &app("app.a"))
        .unwrap()
        .into_iter()
        .map(|s| s.as_str().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["s1", "s2", "s3"]);
}

#[tokio::test]
async fn test_account_removal_tears_down_user_stores() {
    let fx = fixture().await;
    let service = fx.ctx.service();

    service
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &Options::default())
        .unwrap();

    fx.account.publish(AccountEvent::Removed {
        user_id: UserId::new("0"),
    });

    let registry = fx.ctx.registry();
    assert!(!registry.is_store_opened(&UserId::new("0"), &app("app.a"), &store("s1")));
    assert!(fx.ctx.meta().scan(b"StoreMeta:").unwrap().is_empty());
    for level in SecurityLevel::all() {
        assert!(!fx.data_dir.user_dir(level, &UserId::new("0")).exists());
    }
}

#[tokio::test]
async fn test_low_uid_caller_is_denied() {
    let fx = fixture().await;
    let err = fx
        .ctx
        .service()
        .get_single_kv_store(99, &app("app.a"), &store("s1"), &Options::default())
        .unwrap_err();
    assert_eq!(err, Status::PermissionDenied);
}

#[tokio::test]
async fn test_multi_version_kind_is_retired() {
    let fx = fixture().await;
    let options = Options {
        kind: StoreKind::MultiVersion,
        ..Default::default()
    };
    assert_eq!(
        fx.ctx
            .service()
            .get_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &options)
            .unwrap_err(),
        Status::NotSupported
    );
    assert_eq!(
        fx.ctx
            .service()
            .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &options)
            .unwrap_err(),
        Status::InvalidArgument
    );
}

#[tokio::test]
async fn test_create_if_missing_false_fails_with_store_not_open() {
    let fx = fixture().await;
    let options = Options {
        create_if_missing: false,
        ..Default::default()
    };
    assert_eq!(
        fx.ctx
            .service()
            .get_single_kv_store(CALLER_UID, &app("app.a"), &store("absent"), &options)
            .unwrap_err(),
        Status::StoreNotOpen
    );
}

#[tokio::test]
async fn test_device_watch_registration_lifecycle() {
    let fx = fixture().await;
    let service = fx.ctx.service();
    let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let sink = Arc::clone(&seen);
    let token = service
        .start_watch_device_change(Arc::new(move |_event| {
            sink.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }))
        .unwrap();

    let peer = fx.network.register("peer").local_device().id;
    fx.network.set_online(&peer, false);
    wait_until(|| seen.load(std::sync::atomic::Ordering::SeqCst) >= 1).await;

    service.stop_watch_device_change(token).unwrap();
    assert_eq!(
        service.stop_watch_device_change(token).unwrap_err(),
        Status::IllegalState
    );
}

#[tokio::test]
async fn test_relational_store_opens_through_registry() {
    let fx = fixture().await;
    let options = Options {
        kind: StoreKind::Relational,
        ..Default::default()
    };
    let opened = fx
        .ctx
        .service()
        .get_rdb_store(CALLER_UID, &app("app.a"), &store("rdb1"), &options)
        .unwrap();
    let rdb = opened.handle.relational().unwrap();
    rdb.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY NOT NULL, v TEXT)")
        .unwrap();
    rdb.create_distributed_table("t").unwrap();
    assert_eq!(rdb.distributed_tables(), vec!["t".to_string()]);
}

#[tokio::test]
async fn test_dump_reports_open_stores() {
    let fx = fixture().await;
    fx.ctx
        .service()
        .get_single_kv_store(CALLER_UID, &app("app.a"), &store("s1"), &Options::default())
        .unwrap();
    let dump = fx.ctx.service().dump();
    assert!(dump.contains("user buckets: 1"));
    assert!(dump.contains("app.a"));
}
