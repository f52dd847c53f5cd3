//! End-to-end properties of the allocation engine, driven through the
//! public broker API with a manual clock and scripted workers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;

use libspectate::testing::{EPOCH_MS, Harness};
use libspectate::{BrokerConfig, ManualClock, SharedStore, SqliteStore, keys};
use spectate_protocol::{
    RegisterSlotRequest, RegisterWorkloadRequest, SlotState, WatchStatus, WorkerCommand,
};

/// Every assigned slot is mirrored by its workload's forward mapping and no
/// workload holds two slots.
async fn assert_bijection(h: &Harness) {
    let store = h.store();
    let mut owners: HashMap<String, String> = HashMap::new();
    for slot in h.broker.slots().list().await.expect("slots") {
        assert_eq!(
            slot.state.is_assigned(),
            slot.assigned_workload_id.is_some(),
            "slot {} in {} has assignment {:?}",
            slot.id,
            slot.state,
            slot.assigned_workload_id
        );
        if let Some(workload_id) = slot.assigned_workload_id {
            let forward = store.get(&keys::pairing(&workload_id)).await.expect("forward");
            assert_eq!(forward.as_deref(), Some(slot.id.as_str()));
            assert!(
                owners.insert(workload_id.clone(), slot.id.clone()).is_none(),
                "{workload_id} holds two slots"
            );
        }
    }
    for workload in h.broker.registry().all().await.expect("workloads") {
        let forward = store.get(&keys::pairing(&workload.id)).await.expect("forward");
        assert_eq!(forward, owners.get(&workload.id).cloned());
    }
}

#[tokio::test]
async fn concurrent_watches_for_one_workload_share_a_slot() {
    let h = Harness::with_slots(3).await;
    h.online("w1").await;

    let tasks = (0..16).map(|i| {
        let broker = h.broker.clone();
        tokio::spawn(async move { broker.request_watch("w1", Some(format!("viewer-{i}"))).await })
    });
    let results = join_all(tasks).await;

    let mut slots = HashSet::new();
    let mut leases = HashSet::new();
    for result in results {
        let watch = result.expect("task").expect("watch");
        slots.insert(watch.slot_id.expect("slot"));
        leases.insert(watch.lease_id.expect("lease"));
    }
    assert_eq!(slots.len(), 1);
    assert_eq!(leases.len(), 16);
    assert_eq!(h.pool().await.len(), 2);

    let attaches = h
        .worker
        .commands()
        .into_iter()
        .filter(|(_, cmd)| matches!(cmd, WorkerCommand::Attach { .. }))
        .count();
    assert_eq!(attaches, 1);
    assert_eq!(h.broker.get_workload("w1").await.expect("view").viewer_count, 16);
    assert_bijection(&h).await;
}

#[tokio::test]
async fn n_slots_serve_n_workloads_then_no_capacity() {
    const N: usize = 5;
    let h = Harness::with_slots(N).await;
    for i in 0..=N {
        h.online(&format!("w{i}")).await;
    }

    let tasks = (0..N).map(|i| {
        let broker = h.broker.clone();
        tokio::spawn(async move { broker.request_watch(&format!("w{i}"), None).await })
    });
    let mut granted = HashSet::new();
    for result in join_all(tasks).await {
        let watch = result.expect("task").expect("watch");
        assert_eq!(watch.status, WatchStatus::Starting);
        granted.insert(watch.slot_id.expect("slot"));
    }
    assert_eq!(granted.len(), N);

    let refused = h.broker.request_watch(&format!("w{N}"), None).await.expect("extra");
    assert_eq!(refused.status, WatchStatus::NoCapacity);
    assert!(
        h.store()
            .get(&keys::pairing(&format!("w{N}")))
            .await
            .expect("forward")
            .is_none()
    );
    assert_bijection(&h).await;
}

#[tokio::test]
async fn contention_across_more_workloads_than_slots_keeps_bijection() {
    let h = Harness::with_slots(4).await;
    for i in 0..8 {
        h.online(&format!("w{i}")).await;
    }
    let tasks = (0..32).map(|i| {
        let broker = h.broker.clone();
        tokio::spawn(async move { broker.request_watch(&format!("w{}", i % 8), None).await })
    });

    let mut served = HashSet::new();
    for result in join_all(tasks).await {
        let watch = result.expect("task").expect("watch");
        if watch.status != WatchStatus::NoCapacity {
            served.insert(watch.slot_id.expect("slot"));
        }
    }
    assert_eq!(served.len(), 4);
    assert!(h.pool().await.is_empty());
    assert_bijection(&h).await;
}

#[tokio::test]
async fn first_viewer_starts_second_viewer_is_ready() {
    let h = Harness::new().await;
    h.broker
        .register_slot(RegisterSlotRequest {
            id: "s1".to_string(),
            control_url: "http://render-1.invalid".to_string(),
            stream_endpoint: "wss://render-1.invalid/stream".to_string(),
        })
        .await
        .expect("slot");
    h.broker
        .register_workload(RegisterWorkloadRequest {
            id: "w1".to_string(),
            address: "10.0.0.5:7000".to_string(),
            metadata: serde_json::json!({"scenario": "harbor"}),
        })
        .await
        .expect("workload");

    let first = h.broker.request_watch("w1", None).await.expect("first");
    assert_eq!(first.status, WatchStatus::Starting);
    assert_eq!(first.slot_id.as_deref(), Some("s1"));
    assert_eq!(
        first.stream_endpoint.as_deref(),
        Some("wss://render-1.invalid/stream")
    );
    assert_eq!(
        h.worker.commands_for("s1"),
        vec![WorkerCommand::Attach {
            workload_id: "w1".to_string(),
            address: "10.0.0.5:7000".to_string(),
        }]
    );

    h.broker.slot_ready("s1").await.expect("ready");
    let second = h.broker.request_watch("w1", None).await.expect("second");
    assert_eq!(second.status, WatchStatus::Ready);
    assert_eq!(second.slot_id.as_deref(), Some("s1"));
    assert_eq!(h.worker.commands_for("s1").len(), 1);
}

#[tokio::test]
async fn lapsed_leases_stop_counting_before_any_sweep() {
    let h = Harness::with_slots(1).await;
    h.online("w1").await;
    h.broker.request_watch("w1", None).await.expect("watch");
    assert_eq!(h.broker.get_workload("w1").await.expect("view").viewer_count, 1);

    h.clock.advance(h.timeouts().lease_ttl());
    let view = h.broker.get_workload("w1").await.expect("view");
    assert_eq!(view.viewer_count, 0);
    assert!(view.has_slot);
}

#[tokio::test]
async fn lapsed_viewer_drains_then_returns_slot_once() {
    let h = Harness::with_slots(1).await;
    h.online("w1").await;
    h.broker.request_watch("w1", None).await.expect("watch");
    h.broker.slot_ready("slot-0").await.expect("ready");
    let sup = h.broker.supervisor();

    h.clock.advance(h.timeouts().lease_ttl());
    sup.run_lease_sweep().await.expect("sweep");
    assert_eq!(h.slot_state("slot-0").await, SlotState::Draining);

    // Keep the workload itself alive across the drain window.
    h.broker.workload_heartbeat("w1", Some(1)).await.expect("heartbeat");
    h.clock.advance(h.timeouts().drain_timeout());
    h.broker.workload_heartbeat("w1", Some(2)).await.expect("heartbeat");
    let report = sup.run_lease_sweep().await.expect("sweep");
    assert_eq!(report.released, 1);
    assert_eq!(h.slot_state("slot-0").await, SlotState::Idle);

    let again = sup.run_lease_sweep().await.expect("sweep again");
    assert_eq!(again.released, 0);
    sup.run_health_check().await.expect("health");
    assert_eq!(h.pool().await, vec!["slot-0"]);
    assert!(!h.broker.get_workload("w1").await.expect("view").has_slot);
    assert!(h.worker.commands_for("slot-0").contains(&WorkerCommand::Detach {
        workload_id: "w1".to_string()
    }));
    assert_bijection(&h).await;
}

#[tokio::test]
async fn stuck_startup_errors_resets_and_serves_another_workload() {
    let h = Harness::with_slots(1).await;
    h.online("w1").await;
    h.broker.request_watch("w1", None).await.expect("watch");
    let sup = h.broker.supervisor();

    h.clock.advance(h.timeouts().startup_timeout());
    let report = sup.run_health_check().await.expect("health");
    assert_eq!(report.startup_timeouts, 1);
    assert_eq!(h.slot_state("slot-0").await, SlotState::Error);
    assert!(h.pool().await.is_empty());

    let report = sup.run_health_check().await.expect("reset");
    assert_eq!(report.reset, 1);
    assert_eq!(h.slot_state("slot-0").await, SlotState::Idle);
    assert_eq!(h.pool().await, vec!["slot-0"]);

    h.online("w2").await;
    let watch = h.broker.request_watch("w2", None).await.expect("w2");
    assert_eq!(watch.slot_id.as_deref(), Some("slot-0"));
    assert_bijection(&h).await;
}

#[tokio::test]
async fn duplicated_supervisor_passes_are_harmless() {
    let h = Harness::with_slots(2).await;
    h.online("w1").await;
    h.online("w2").await;
    h.broker.request_watch("w1", None).await.expect("w1");
    h.broker.request_watch("w2", None).await.expect("w2");
    h.broker.slot_ready("slot-0").await.expect("ready");
    h.clock.advance(h.timeouts().lease_ttl());

    let sup = h.broker.supervisor().clone();
    let replica = h.broker.supervisor().clone();
    let (a, b) = tokio::join!(sup.run_lease_sweep(), replica.run_lease_sweep());
    let (a, b) = (a.expect("sweep a"), b.expect("sweep b"));
    assert_eq!(a.expired_leases + b.expired_leases, 2);
    assert_eq!(a.draining + b.draining, 1);
    assert_bijection(&h).await;
}

#[tokio::test]
async fn sqlite_store_keeps_pairings_across_restarts() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("state.db");
    let clock = Arc::new(ManualClock::new(EPOCH_MS));

    let store: SharedStore = Arc::new(SqliteStore::open(&path, clock.clone())?);
    let h = Harness::with_store(store, clock.clone(), BrokerConfig::default(), 2).await;
    h.online("w1").await;
    let watch = h.broker.request_watch("w1", None).await?;
    h.broker.slot_ready(watch.slot_id.as_deref().unwrap_or_default()).await?;
    assert_bijection(&h).await;
    drop(h);

    let store: SharedStore = Arc::new(SqliteStore::open(&path, clock.clone())?);
    let h = Harness::with_store(store, clock, BrokerConfig::default(), 0).await;
    let view = h.broker.get_workload("w1").await?;
    assert_eq!(view.slot_id, watch.slot_id);
    assert_eq!(view.viewer_count, 1);

    let status = h.broker.status().await?;
    assert_eq!(status.active, 1);
    assert_eq!(status.idle_pool, 1);
    Ok(())
}
