//! Queue admission, quota, termination, and cancellation tests against
//! the in-memory channel transport.

use quilt_model::{DeviceId, Status};
use quilt_sync::sim::ChannelNetwork;
use quilt_sync::{DeviceStatus, SyncAck, SyncMode, SyncParams, Syncer, Transport, TransportError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Fixture {
    network: ChannelNetwork,
    syncer: Arc<Syncer>,
    peer: DeviceId,
}

fn fixture() -> Fixture {
    let network = ChannelNetwork::new();
    let local = network.register("local");
    let peer = network.register("peer").local_device().id;

    let syncer = Arc::new(Syncer::new("user/app.a/s1"));
    syncer.initialize(Arc::new(local)).unwrap();
    Fixture {
        network,
        syncer,
        peer,
    }
}

fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached");
}

#[test]
fn test_sync_before_initialize_is_not_init() {
    let syncer = Syncer::new("user/app.a/s1");
    let err = syncer
        .sync(SyncParams::new(vec![DeviceId::new("dev")], SyncMode::Push, false))
        .unwrap_err();
    assert_eq!(err, Status::NotInit);
}

#[test]
fn test_empty_device_list_rejected() {
    let fx = fixture();
    let err = fx
        .syncer
        .sync(SyncParams::new(Vec::new(), SyncMode::Push, false))
        .unwrap_err();
    assert_eq!(err, Status::InvalidArgument);
}

#[test]
fn test_wait_sync_completes_with_ok_status() {
    let fx = fixture();
    let statuses = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&statuses);

    let mut params = SyncParams::new(vec![fx.peer.clone()], SyncMode::PushPull, true);
    params.on_complete = Some(Box::new(move |map| {
        *sink.lock().unwrap() = Some(map.clone());
    }));
    let sync_id = fx.syncer.sync(params).unwrap();
    assert!(sync_id >= 1);

    let statuses = statuses.lock().unwrap().clone().unwrap();
    assert_eq!(statuses[&fx.peer], DeviceStatus::Ok);
    assert_eq!(fx.syncer.get_queued_sync_size(), 0);
}

#[test]
fn test_completion_and_finalize_fire_exactly_once() {
    let fx = fixture();
    let completions = Arc::new(AtomicUsize::new(0));
    let finalizes = Arc::new(AtomicUsize::new(0));

    let mut params = SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false);
    let complete_sink = Arc::clone(&completions);
    params.on_complete = Some(Box::new(move |_| {
        complete_sink.fetch_add(1, Ordering::SeqCst);
    }));
    let finalize_sink = Arc::clone(&finalizes);
    params.on_finalize = Some(Box::new(move || {
        finalize_sink.fetch_add(1, Ordering::SeqCst);
    }));
    fx.syncer.sync(params).unwrap();

    wait_for(|| completions.load(Ordering::SeqCst) == 1);
    wait_for(|| finalizes.load(Ordering::SeqCst) == 1);
    // Nothing further fires.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(finalizes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_manual_sync_quota() {
    let fx = fixture();
    fx.syncer.set_queued_sync_limit(2);
    fx.network.set_latency(Duration::from_millis(300));

    let first = fx
        .syncer
        .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false));
    let second = fx
        .syncer
        .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false));
    let third = fx
        .syncer
        .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false));
    let fourth = fx
        .syncer
        .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false));

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(third.unwrap_err(), Status::Busy);
    assert_eq!(fourth.unwrap_err(), Status::Busy);

    // Once in-flight work drains, a new submission is admitted.
    wait_for(|| fx.syncer.get_queued_sync_size() == 0);
    assert!(fx
        .syncer
        .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false))
        .is_ok());
}

#[test]
fn test_auto_sync_bypasses_quota() {
    let fx = fixture();
    fx.syncer.set_queued_sync_limit(1);
    fx.network.set_latency(Duration::from_millis(200));

    fx.syncer
        .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false))
        .unwrap();
    // Queue full for manual work, auto sync still admitted.
    assert!(fx
        .syncer
        .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::AutoPush, false))
        .is_ok());
    assert_eq!(fx.syncer.get_queued_sync_size(), 1);
}

#[test]
fn test_disable_manual_sync_only_when_drained() {
    let fx = fixture();
    fx.network.set_latency(Duration::from_millis(200));
    fx.syncer
        .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false))
        .unwrap();

    assert_eq!(fx.syncer.disable_manual_sync().unwrap_err(), Status::Busy);

    wait_for(|| fx.syncer.get_queued_sync_size() == 0);
    fx.syncer.disable_manual_sync().unwrap();
    assert_eq!(
        fx.syncer
            .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false))
            .unwrap_err(),
        Status::Busy
    );

    fx.syncer.enable_manual_sync();
    assert!(fx
        .syncer
        .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false))
        .is_ok());
}

#[test]
fn test_stop_sync_kills_in_flight_operations() {
    let fx = fixture();
    fx.network.set_latency(Duration::from_millis(500));
    let statuses = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&statuses);

    let mut params = SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false);
    params.on_complete = Some(Box::new(move |map| {
        *sink.lock().unwrap() = Some(map.clone());
    }));
    fx.syncer.sync(params).unwrap();

    fx.syncer.stop_sync();
    let map = statuses.lock().unwrap().clone().unwrap();
    assert_eq!(map[&fx.peer], DeviceStatus::Killed);
    assert_eq!(fx.syncer.get_queued_sync_size(), 0);
}

#[test]
fn test_remove_unknown_sync_operation_fails() {
    let fx = fixture();
    assert_eq!(
        fx.syncer.remove_sync_operation(12345).unwrap_err(),
        Status::InvalidArgument
    );
}

#[test]
fn test_offline_device_reports_offline_status() {
    let fx = fixture();
    fx.network.set_online(&fx.peer, false);

    let statuses = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&statuses);
    let mut params = SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, true);
    params.on_complete = Some(Box::new(move |map| {
        *sink.lock().unwrap() = Some(map.clone());
    }));
    fx.syncer.sync(params).unwrap();

    let map = statuses.lock().unwrap().clone().unwrap();
    assert_eq!(map[&fx.peer], DeviceStatus::Offline);
}

#[test]
fn test_per_device_failure_does_not_cancel_siblings() {
    let network = ChannelNetwork::new();
    let local = network.register("local");
    let good = network.register("good").local_device().id;
    let bad = network.register("bad").local_device().id;
    network.set_handler(
        &bad,
        Arc::new(|_, _| Err(TransportError::Failed("boom".into()))),
    );

    let syncer = Arc::new(Syncer::new("user/app.a/s1"));
    syncer.initialize(Arc::new(local)).unwrap();

    let statuses = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&statuses);
    let mut params = SyncParams::new(vec![good.clone(), bad.clone()], SyncMode::Push, true);
    params.on_complete = Some(Box::new(move |map| {
        *sink.lock().unwrap() = Some(map.clone());
    }));
    syncer.sync(params).unwrap();

    let map = statuses.lock().unwrap().clone().unwrap();
    assert_eq!(map[&good], DeviceStatus::Ok);
    assert_eq!(map[&bad], DeviceStatus::Failed);
}

#[test]
fn test_sync_retry_recovers_flaky_exchange() {
    let network = ChannelNetwork::new();
    let local = network.register("local");
    let flaky = network.register("flaky").local_device().id;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    network.set_handler(
        &flaky,
        Arc::new(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TransportError::Failed("first attempt".into()))
            } else {
                Ok(SyncAck::default())
            }
        }),
    );

    let syncer = Arc::new(Syncer::new("user/app.a/s1"));
    syncer.initialize(Arc::new(local)).unwrap();
    syncer.engine().set_sync_retry(true);

    let statuses = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&statuses);
    let mut params = SyncParams::new(vec![flaky.clone()], SyncMode::Push, true);
    params.on_complete = Some(Box::new(move |map| {
        *sink.lock().unwrap() = Some(map.clone());
    }));
    syncer.sync(params).unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let map = statuses.lock().unwrap().clone().unwrap();
    assert_eq!(map[&flaky], DeviceStatus::Ok);
}

#[test]
fn test_remote_data_change_triggers_auto_sync() {
    let fx = fixture();
    let exchanges = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&exchanges);
    fx.network.set_handler(
        &fx.peer,
        Arc::new(move |_, request| {
            assert_eq!(request.mode, SyncMode::AutoPull);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(SyncAck::default())
        }),
    );

    // Without auto sync the notification is ignored.
    fx.network.notify_data_changed(&fx.peer);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(exchanges.load(Ordering::SeqCst), 0);

    fx.syncer.set_auto_sync(true);
    fx.network.notify_data_changed(&fx.peer);
    wait_for(|| exchanges.load(Ordering::SeqCst) == 1);
}

#[test]
fn test_close_is_idempotent_and_drains() {
    let fx = fixture();
    fx.network.set_latency(Duration::from_millis(100));
    fx.syncer
        .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false))
        .unwrap();

    fx.syncer.close();
    fx.syncer.close();
    assert_eq!(fx.syncer.get_queued_sync_size(), 0);
    assert_eq!(
        fx.syncer
            .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::Push, false))
            .unwrap_err(),
        Status::NotInit
    );
}

#[test]
fn test_sync_ids_are_unique_and_positive() {
    let fx = fixture();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..100 {
        let id = fx
            .syncer
            .sync(SyncParams::new(vec![fx.peer.clone()], SyncMode::AutoPush, false))
            .unwrap();
        assert!(id >= 1);
        assert!(seen.insert(id));
    }
}
