mod common;

use common::{fork_config, settle, CreateOutcome, FakeProvisioner};
use icarus::bus::{EventBus, EventKind, EventPayload, MailboxRecv};
use icarus::fork::{ForkConfig, ForkManager, ForkRecord, ForkRequest, ForkStatus};
use icarus::persistence::{MemoryStore, StateStore};
use icarus::supervisor::{AgentSupervisor, AlertManager, SupervisorConfig};
use icarus::IcarusError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::assert_ok;

fn manager(config: ForkConfig, bus: &EventBus, provider: &FakeProvisioner) -> ForkManager {
    ForkManager::builder(config, bus.clone(), Arc::new(provider.clone())).build()
}

fn request(ttl_secs: u64) -> ForkRequest {
    ForkRequest::new("backtester", "validate strategy", Duration::from_secs(ttl_secs))
}

/// At capacity a request is refused without a record; once the first fork
/// expires and a sweep reclaims it, the same request succeeds.
#[tokio::test(start_paused = true)]
async fn capacity_frees_after_ttl_sweep() {
    let bus = EventBus::default();
    let provider = FakeProvisioner::new();
    let forks = manager(fork_config(1), &bus, &provider);

    let a = forks.request(request(60)).await.unwrap();
    settle().await;
    assert_eq!(forks.get(&a).await.unwrap().status, ForkStatus::Active);

    let err = forks.request(request(60)).await.unwrap_err();
    assert!(matches!(err, IcarusError::Capacity { live: 1, max: 1 }));
    assert_eq!(forks.forks().await.len(), 1, "rejected request left a record");

    tokio::time::advance(Duration::from_secs(61)).await;
    let report = forks.reap_expired().await;
    assert_eq!(report.expired, 1);
    assert_eq!(report.destroyed, 1);
    assert_eq!(forks.get(&a).await.unwrap().status, ForkStatus::Destroyed);
    assert_eq!(provider.live_services(), 0);

    let b = forks.request(request(60)).await.unwrap();
    settle().await;
    assert_eq!(forks.get(&b).await.unwrap().status, ForkStatus::Active);
}

/// A sweep before the deadline leaves the fork alone.
#[tokio::test(start_paused = true)]
async fn unexpired_fork_survives_sweep() {
    let bus = EventBus::default();
    let provider = FakeProvisioner::new();
    let forks = manager(fork_config(2), &bus, &provider);

    let id = forks.request(request(600)).await.unwrap();
    settle().await;

    tokio::time::advance(Duration::from_secs(599)).await;
    assert_eq!(forks.reap_expired().await.expired, 0);
    assert_eq!(forks.get(&id).await.unwrap().status, ForkStatus::Active);
    assert_eq!(provider.destroy_calls(), 0);
}

/// Completing twice destroys once and announces once.
#[tokio::test(start_paused = true)]
async fn double_complete_is_a_no_op() {
    let bus = EventBus::default();
    let mut destroyed = bus.subscribe(EventKind::ForkDestroyed).unwrap();
    let provider = FakeProvisioner::new();
    let forks = manager(fork_config(2), &bus, &provider);

    let id = forks.request(request(600)).await.unwrap();
    settle().await;

    forks
        .complete_with_result(&id, json!({ "sharpe": 1.4 }))
        .await
        .unwrap();
    forks.complete(&id).await.unwrap();

    let record = forks.get(&id).await.unwrap();
    assert_eq!(record.status, ForkStatus::Destroyed);
    assert_eq!(record.result, Some(json!({ "sharpe": 1.4 })));
    assert_eq!(provider.destroy_calls(), 1);
    assert!(destroyed.try_recv().is_some());
    assert!(destroyed.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn complete_unknown_fork_is_not_found() {
    let bus = EventBus::default();
    let forks = manager(fork_config(2), &bus, &FakeProvisioner::new());

    let err = forks.complete(&"does-not-exist".into()).await.unwrap_err();
    assert!(matches!(err, IcarusError::ForkNotFound(_)));
}

/// A create that times out on our side but succeeded remotely ends up
/// active, found by its deterministic name.
#[tokio::test(start_paused = true)]
async fn ambiguous_create_that_succeeded_is_active() {
    let bus = EventBus::default();
    let mut created = bus.subscribe(EventKind::ForkCreated).unwrap();
    let provider = FakeProvisioner::new();
    provider.script_creates(&[CreateOutcome::AmbiguousButCreated]);
    let forks = manager(fork_config(2), &bus, &provider);

    let id = forks.request(request(600)).await.unwrap();
    settle().await;

    let record = forks.get(&id).await.unwrap();
    assert_eq!(record.status, ForkStatus::Active);
    assert!(provider.exists(&id.external_name()));
    assert_eq!(provider.create_calls(), 1, "create must not be retried");
    assert_eq!(provider.find_calls(), 1);

    match &created.try_recv().unwrap().payload {
        EventPayload::ForkCreated {
            fork_id,
            service_id,
            access,
            ..
        } => {
            assert_eq!(fork_id, id.as_str());
            assert_eq!(Some(service_id), record.service_id.as_ref());
            assert_eq!(access["port"], 5432);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn ambiguous_create_that_failed_is_failed() {
    let bus = EventBus::default();
    let mut failed = bus.subscribe(EventKind::ForkFailed).unwrap();
    let provider = FakeProvisioner::new();
    provider.script_creates(&[CreateOutcome::AmbiguousNotCreated]);
    let forks = manager(fork_config(1), &bus, &provider);

    let id = forks.request(request(600)).await.unwrap();
    settle().await;

    assert_eq!(forks.get(&id).await.unwrap().status, ForkStatus::Failed);
    assert_eq!(forks.live_count().await, 0);
    match &failed.try_recv().unwrap().payload {
        EventPayload::ForkFailed { fork_id, .. } => {
            assert_eq!(fork_id.as_deref(), Some(id.as_str()))
        }
        other => panic!("unexpected payload {:?}", other),
    }

    // Failed forks do not hold capacity
    forks.request(request(600)).await.unwrap();
}

/// Destroy failures are retried by the reaper and escalate as a leak once
/// the attempt budget is spent.
#[tokio::test(start_paused = true)]
async fn exhausted_destroy_retries_report_a_leak() {
    let bus = EventBus::default();
    let mut leaks = bus.subscribe(EventKind::ForkLeakDetected).unwrap();
    let provider = FakeProvisioner::new();
    provider.fail_destroys(u32::MAX);
    let alerts = Arc::new(AlertManager::with_defaults());
    let mut alert_rx = alerts.subscribe();
    let forks = ForkManager::builder(fork_config(2), bus.clone(), Arc::new(provider.clone()))
        .alerts(alerts)
        .build();

    let id = forks.request(request(600)).await.unwrap();
    settle().await;

    assert!(matches!(
        forks.complete(&id).await,
        Err(IcarusError::Destroy { .. })
    ));
    let record = forks.get(&id).await.unwrap();
    assert_eq!(record.status, ForkStatus::Destroying);
    assert_eq!(record.destroy_attempts, 1);
    assert_eq!(forks.live_count().await, 1);

    let report = forks.reap_expired().await;
    assert_eq!((report.retried, report.failed), (1, 1));
    assert!(leaks.try_recv().is_none());

    forks.reap_expired().await;
    let record = forks.get(&id).await.unwrap();
    assert_eq!(record.status, ForkStatus::Failed);
    assert_eq!(record.destroy_attempts, 3);
    assert_eq!(provider.destroy_calls(), 3);

    match &leaks.try_recv().unwrap().payload {
        EventPayload::ForkLeakDetected {
            fork_id, attempts, ..
        } => {
            assert_eq!(fork_id, id.as_str());
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(alert_rx.try_recv().unwrap().title, "Fork Leak Detected");

    // Leaked forks are not retried again
    assert_eq!(forks.reap_expired().await.retried, 0);
    assert_eq!(provider.destroy_calls(), 3);
}

/// A transient destroy failure is retried and then succeeds.
#[tokio::test(start_paused = true)]
async fn transient_destroy_failure_recovers_on_retry() {
    let bus = EventBus::default();
    let provider = FakeProvisioner::new();
    provider.fail_destroys(1);
    let forks = manager(fork_config(2), &bus, &provider);

    let id = forks.request(request(600)).await.unwrap();
    settle().await;
    assert!(forks.complete(&id).await.is_err());

    let report = forks.reap_expired().await;
    assert_eq!((report.retried, report.destroyed), (1, 1));
    let record = forks.get(&id).await.unwrap();
    assert_eq!(record.status, ForkStatus::Destroyed);
    assert!(record.last_error.is_none());
}

/// Completing a fork while it is still being created destroys it as soon
/// as provisioning lands.
#[tokio::test(start_paused = true)]
async fn complete_while_creating_is_deferred() {
    let bus = EventBus::default();
    let mut destroyed = bus.subscribe(EventKind::ForkDestroyed).unwrap();
    let provider = FakeProvisioner::new();
    provider.delay_creates(Duration::from_secs(5));
    let forks = manager(fork_config(2), &bus, &provider);

    let id = forks.request(request(600)).await.unwrap();
    settle().await;
    assert_eq!(forks.get(&id).await.unwrap().status, ForkStatus::Creating);

    forks.complete(&id).await.unwrap();
    assert_eq!(provider.destroy_calls(), 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(forks.get(&id).await.unwrap().status, ForkStatus::Destroyed);
    assert_eq!(provider.live_services(), 0);
    assert!(destroyed.try_recv().is_some());
}

/// Shutdown refuses new work and destroys every provisioned fork.
#[tokio::test(start_paused = true)]
async fn shutdown_destroys_active_forks() {
    let bus = EventBus::default();
    let provider = FakeProvisioner::new();
    let forks = manager(fork_config(3), &bus, &provider);

    let a = forks.request(request(600)).await.unwrap();
    let b = forks.request(request(600)).await.unwrap();
    settle().await;
    assert_eq!(provider.live_services(), 2);

    forks.shutdown().await;
    assert_eq!(provider.live_services(), 0);
    for id in [&a, &b] {
        assert_eq!(forks.get(id).await.unwrap().status, ForkStatus::Destroyed);
    }

    let err = forks.request(request(600)).await.unwrap_err();
    assert!(matches!(err, IcarusError::ShuttingDown(_)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_can_leave_forks_running() {
    let bus = EventBus::default();
    let provider = FakeProvisioner::new();
    let config = ForkConfig {
        destroy_on_shutdown: false,
        ..fork_config(2)
    };
    let forks = manager(config, &bus, &provider);

    let id = forks.request(request(600)).await.unwrap();
    settle().await;
    forks.shutdown().await;

    assert_eq!(provider.live_services(), 1);
    assert_eq!(forks.get(&id).await.unwrap().status, ForkStatus::Active);
}

/// Every transition is written through to the store, and a fork caught
/// mid-creation by a restart is reconciled against the provider.
#[tokio::test(start_paused = true)]
async fn restart_reconciles_creating_forks() {
    let bus = EventBus::default();
    let provider = FakeProvisioner::new();
    let store = Arc::new(MemoryStore::new());

    let forks = ForkManager::builder(fork_config(2), bus.clone(), Arc::new(provider.clone()))
        .store(store.clone())
        .build();
    let id = forks.request(request(600)).await.unwrap();
    settle().await;

    let persisted = store.fork(&id).await.unwrap();
    assert_eq!(persisted.status, ForkStatus::Active);
    let transitions = store
        .audit_entries()
        .await
        .into_iter()
        .filter(|e| e.category == "fork")
        .count();
    assert_eq!(transitions, 2);

    // A record the previous process never finished creating
    let mut orphan = ForkRecord::creating("svc-parent", &request(600));
    orphan.id = "orphan01".into();
    store.upsert_fork(&orphan).await.unwrap();
    provider.insert(&orphan.id.external_name());

    let restarted = ForkManager::builder(fork_config(2), bus, Arc::new(provider.clone()))
        .store(store.clone())
        .build();
    assert_eq!(restarted.recover().await.unwrap(), 2);
    settle().await;

    assert_eq!(
        restarted.get(&orphan.id).await.unwrap().status,
        ForkStatus::Active
    );
    assert_eq!(restarted.get(&id).await.unwrap().status, ForkStatus::Active);
    assert_eq!(provider.create_calls(), 1);
}

/// End to end through the bus: a supervised manager serves a request
/// event and reclaims the fork between its TTL and the next sweep.
#[tokio::test(start_paused = true)]
async fn supervised_manager_serves_requests_and_reaps_on_schedule() {
    let bus = EventBus::default();
    let mut created = bus.subscribe(EventKind::ForkCreated).unwrap();
    let mut destroyed = bus.subscribe(EventKind::ForkDestroyed).unwrap();
    let provider = FakeProvisioner::new();
    let forks = manager(fork_config(2), &bus, &provider);

    let supervisor = Arc::new(AgentSupervisor::new(
        Arc::new(forks.clone()),
        bus.clone(),
        SupervisorConfig {
            poll_interval_ms: 100,
            stop_timeout_ms: 1000,
            heartbeat_interval_secs: 0,
        },
    ));
    let handle = supervisor.spawn();
    settle().await;

    bus.publish(icarus::bus::Event::new(
        "backtester",
        EventPayload::ForkRequested {
            requester: "backtester".into(),
            purpose: "validate strategy".into(),
            ttl_secs: Some(60),
        },
    ));

    let fork_id = match created.recv_timeout(Duration::from_secs(5)).await {
        MailboxRecv::Event(event) => match &event.payload {
            EventPayload::ForkCreated { fork_id, .. } => fork_id.clone(),
            other => panic!("unexpected payload {:?}", other),
        },
        other => panic!("no fork created: {:?}", other),
    };
    let active_at = Instant::now();

    match destroyed.recv_timeout(Duration::from_secs(120)).await {
        MailboxRecv::Event(event) => match &event.payload {
            EventPayload::ForkDestroyed {
                fork_id: gone,
                reason,
                ..
            } => {
                assert_eq!(gone, &fork_id);
                assert_eq!(reason, "ttl_expired");
            }
            other => panic!("unexpected payload {:?}", other),
        },
        other => panic!("fork never reclaimed: {:?}", other),
    }
    let lifetime = active_at.elapsed();
    let sweep = Duration::from_secs(forks.config().reaper_interval_secs);
    assert!(lifetime >= Duration::from_secs(60), "reaped early: {:?}", lifetime);
    assert!(
        lifetime <= Duration::from_secs(60) + sweep,
        "reaped late: {:?}",
        lifetime
    );

    supervisor.stop().await.unwrap();
    handle.await.unwrap().unwrap();
}

/// A destroy stuck at the provider holds up only its own fork: another fork
/// expiring meanwhile is still reclaimed by the next sweep.
#[tokio::test(start_paused = true)]
async fn slow_destroy_does_not_stall_the_reaper() {
    let bus = EventBus::default();
    let mut destroyed = bus.subscribe(EventKind::ForkDestroyed).unwrap();
    let provider = FakeProvisioner::new();
    let forks = manager(fork_config(2), &bus, &provider);

    let supervisor = Arc::new(AgentSupervisor::new(
        Arc::new(forks.clone()),
        bus.clone(),
        SupervisorConfig {
            poll_interval_ms: 100,
            stop_timeout_ms: 1000,
            heartbeat_interval_secs: 0,
        },
    ));
    let handle = supervisor.spawn();
    settle().await;

    let slow = assert_ok!(forks.request(request(5)).await);
    let quick = assert_ok!(forks.request(request(25)).await);
    provider.stall_next_destroy(Duration::from_secs(100));
    settle().await;
    let active_at = Instant::now();

    match destroyed.recv_timeout(Duration::from_secs(60)).await {
        MailboxRecv::Event(event) => match &event.payload {
            EventPayload::ForkDestroyed { fork_id, .. } => assert_eq!(fork_id, quick.as_str()),
            other => panic!("unexpected payload {:?}", other),
        },
        other => panic!("second fork never reclaimed: {:?}", other),
    }
    let sweep = Duration::from_secs(forks.config().reaper_interval_secs);
    assert!(active_at.elapsed() <= Duration::from_secs(25) + sweep);
    assert_eq!(forks.get(&quick).await.unwrap().status, ForkStatus::Destroyed);
    assert_eq!(forks.get(&slow).await.unwrap().status, ForkStatus::Destroying);

    assert_ok!(supervisor.stop().await);
    handle.await.unwrap().unwrap();
}
