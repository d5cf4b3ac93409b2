//! End-to-end scenario tests, driven through the `Controller` against an
//! in-memory `MockContainerRuntime`.

use std::sync::Arc;

use chrono::Utc;
use fleet_controller::config::Config;
use fleet_controller::controller::{Controller, FetchOutcome};
use fleet_controller::instance_manager::MockContainerRuntime;
use fleet_controller::{ContainerRuntime, MonitoringSnapshot, Registry};

async fn spawn(config: Config) -> (fleet_controller::ControllerHandle, Arc<Registry>) {
    let registry = Arc::new(Registry::open_in_memory().unwrap());
    let runtime = Arc::new(MockContainerRuntime::default());
    let (handle, _join) = Controller::spawn(registry.clone(), runtime, config).await.unwrap();
    (handle, registry)
}

#[tokio::test]
async fn scenario_cold_start_to_warm_floor() {
    let mut config = Config::default();
    config.min_instances = 2;
    config.max_instances = 5;
    let (_handle, registry) = spawn(config).await;

    assert_eq!(registry.get_instance_count(false).unwrap(), 2);
    let cap = registry.get_capacity().unwrap();
    assert_eq!(cap.current_count, 2);
    assert_eq!(cap.max_count, 5);
}

#[tokio::test]
async fn scenario_optimistic_crossing_creates_second_instance() {
    let mut config = Config::default();
    config.min_instances = 1;
    config.max_instances = 5;
    config.max_requests_per_instance = Some(10);
    config.scale_up_capacity_threshold = 0.7; // limit = 7
    let (handle, registry) = spawn(config).await;

    let instances = registry.get_instances(Default::default()).unwrap();
    let name = instances[0].name.clone();
    // Push active_requests to 6 so the next increment (via fetch) crosses 7.
    registry.increment_requests(&name, Utc::now(), true, 6).unwrap();

    let outcome = handle.fetch("/some/path", false).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Forwarded { .. } | FetchOutcome::InternalError));

    // Give the detached optimistic scale-up step a chance to run on the actor.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(registry.get_instance_count(false).unwrap(), 2);
}

#[tokio::test]
async fn scenario_metric_edge_trigger_dedup() {
    let mut config = Config::default();
    config.min_instances = 1;
    config.max_instances = 5;
    config.scale_threshold = 75.0;
    let (_handle, registry) = spawn(config).await;

    let instances = registry.get_instances(Default::default()).unwrap();
    let name = instances[0].name.clone();
    registry.update_metrics(&name, 90.0, 10.0, 10.0).unwrap();

    let scaler = fleet_controller::scaler::Scaler::new(registry.clone(), Config::default());
    let t0 = Utc::now();
    assert!(scaler.should_scale_up_for_metrics(t0).unwrap());

    // same instance still overloaded 30s later, within 60s cooldown: no fire
    let t1 = t0 + chrono::Duration::seconds(30);
    assert!(!scaler.should_scale_up_for_metrics(t1).unwrap());

    // past cooldown: eligible again
    let t2 = t0 + chrono::Duration::seconds(70);
    assert!(scaler.should_scale_up_for_metrics(t2).unwrap());
}

#[tokio::test]
async fn scenario_hysteresis_scale_down_then_drain() {
    let mut config = Config::default();
    config.min_instances = 0;
    config.max_instances = 5;
    let (_handle, registry) = spawn(config.clone()).await;

    let now = Utc::now();
    registry.record_instance("a", 0, true, now).unwrap();
    registry.record_instance("b", 0, true, now).unwrap();
    registry.update_metrics("a", 28.0, 5.0, 5.0).unwrap();
    registry.update_metrics("b", 29.0, 5.0, 5.0).unwrap();

    let scaler = fleet_controller::scaler::Scaler::new(registry.clone(), config);
    assert!(scaler.should_scale_down(now).unwrap());
    let removals = scaler.select_instances_for_removal().unwrap();
    assert!(!removals.is_empty());

    registry.mark_draining(&removals[0].name, now).unwrap();
    let rec = registry.get_instance_by_name(&removals[0].name).unwrap().unwrap();
    assert!(rec.draining);
    assert_eq!(rec.active_requests, 0);
}

#[tokio::test]
async fn scenario_drain_timeout_forces_destruction() {
    let mut config = Config::default();
    config.drain_timeout_ms = 1; // force the timeout branch deterministically
    let (_handle, registry) = spawn(config.clone()).await;

    let t0 = Utc::now();
    registry.record_instance("busy", 3, true, t0).unwrap();
    registry.mark_draining("busy", t0).unwrap();

    // simulate time passing beyond drainTimeout with requests still in flight
    let t1 = t0 + chrono::Duration::milliseconds(100);
    let rec = registry.get_instance_by_name("busy").unwrap().unwrap();
    let timed_out = rec
        .draining_since
        .map(|since| t1 - since >= chrono::Duration::milliseconds(config.drain_timeout_ms as i64))
        .unwrap_or(false);
    assert!(timed_out);
    assert!(rec.active_requests > 0);
}

#[tokio::test]
async fn scenario_stale_cleanup_on_startup() {
    let registry = Arc::new(Registry::open_in_memory().unwrap());
    let mut config = Config::default();
    config.min_instances = 1;
    config.max_instances = 5;
    registry.migrate(config.max_instances).unwrap();

    let now = Utc::now();
    registry.record_instance("ghost-1", 0, true, now).unwrap();
    registry.record_instance("ghost-2", 0, true, now).unwrap();
    registry.record_instance("real-1", 0, true, now).unwrap();
    // Seed capacity to reflect the pre-existing (unverified) rows.
    for _ in 0..3 {
        registry.try_reserve_slot().unwrap();
    }

    let runtime = Arc::new(MockContainerRuntime::default());
    // Only "real-1" actually exists in the runtime.
    runtime.create("real-1").await.unwrap();

    let (_handle, _join) = Controller::spawn(registry.clone(), runtime, config).await.unwrap();

    assert_eq!(registry.get_instance_count(false).unwrap(), 1);
    assert!(registry.get_instance_by_name("ghost-1").unwrap().is_none());
    assert!(registry.get_instance_by_name("ghost-2").unwrap().is_none());
}

#[tokio::test]
async fn monitoring_snapshot_round_trips_through_the_http_surface() {
    let mut config = Config::default();
    config.min_instances = 1;
    let (handle, _registry) = spawn(config.clone()).await;

    let outcome = handle.fetch(&config.monitoring_endpoint, true).await.unwrap();
    let FetchOutcome::Forwarded { status, body } = outcome else {
        panic!("expected forwarded snapshot")
    };
    assert_eq!(status, 200);
    let snapshot: MonitoringSnapshot = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot.instance_count, 1);
}
