//! Controller: the singleton actor. Serialises all mutations on
//! itself using a single-threaded cooperative model, enforced structurally
//! by routing every operation through one actor task reached via a
//! cloneable `ControllerHandle` — suspension only happens at explicit I/O
//! awaits inside that task, never interleaved with another message.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{ControllerError, Result};
use crate::instance_manager::{ContainerHandle, ContainerRuntime, InstanceManager};
use crate::model::{InstanceFilter, MonitoringSnapshot};
use crate::registry::Registry;
use crate::router::Router;
use crate::scaler::Scaler;

/// Outcome of routing a single request, returned to the HTTP layer.
pub enum FetchOutcome {
    Forwarded { status: u16, body: Vec<u8> },
    ServiceUnavailable { retry_after_secs: Option<u64> },
    InternalError,
}

enum Message {
    Fetch {
        path: String,
        is_monitoring_get: bool,
        respond_to: oneshot::Sender<Result<FetchOutcome>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Result<MonitoringSnapshot>>,
    },
    Heartbeat,
    /// Self-queued: the background half of optimistic scale-up. Enqueuing
    /// it rather than awaiting it inline lets `handle_fetch` respond to the triggering
    /// request first; it still runs as an ordinary cooperative step on this
    /// same actor, never interleaved with another message mid-flight.
    OptimisticScaleUp,
    /// Self-queued: the post-response `active_requests` decrement for a
    /// completed fetch. Queued on the actor rather than spawned as a bare
    /// task so it can never race a concurrent reader of the same row.
    Decrement(String),
    Shutdown,
}

/// Cloneable front door onto the Controller actor. All calls are
/// message-passes onto the single actor task, so concurrent callers never
/// observe interleaved mutation.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Message>,
}

impl ControllerHandle {
    pub async fn fetch(&self, path: &str, is_monitoring_get: bool) -> Result<FetchOutcome> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(Message::Fetch {
                path: path.to_string(),
                is_monitoring_get,
                respond_to,
            })
            .await
            .map_err(|_| ControllerError::FatalInternal("controller actor is gone".into()))?;
        rx.await.map_err(|_| ControllerError::FatalInternal("controller actor dropped response".into()))?
    }

    pub async fn snapshot(&self) -> Result<MonitoringSnapshot> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(Message::Snapshot { respond_to })
            .await
            .map_err(|_| ControllerError::FatalInternal("controller actor is gone".into()))?;
        rx.await.map_err(|_| ControllerError::FatalInternal("controller actor dropped response".into()))?
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown).await;
    }
}

pub struct Controller {
    registry: Arc<Registry>,
    router: Router,
    scaler: Scaler,
    instance_manager: Arc<InstanceManager>,
    config: Config,
    handles: std::collections::HashMap<String, Arc<dyn ContainerHandle>>,
    rx: mpsc::Receiver<Message>,
    self_tx: mpsc::Sender<Message>,
}

impl Controller {
    /// Runs the full init sequence and spawns the actor task,
    /// returning a handle. The returned join handle drives the heartbeat
    /// scheduling loop and can be awaited for graceful shutdown.
    #[instrument(skip(runtime, config))]
    pub async fn spawn(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        config: Config,
    ) -> Result<(ControllerHandle, tokio::task::JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(256);
        let instance_manager = Arc::new(InstanceManager::new(registry.clone(), runtime, config.clone()));
        let router = Router::new(registry.clone(), config.clone());
        let scaler = Scaler::new(registry.clone(), config.clone());

        let mut controller = Controller {
            registry: registry.clone(),
            router,
            scaler,
            instance_manager,
            config: config.clone(),
            handles: std::collections::HashMap::new(),
            rx,
            self_tx: tx.clone(),
        };

        controller.init().await?;

        let heartbeat_tx = tx.clone();
        let interval_ms = config.heartbeat_interval_ms;
        let join = tokio::spawn(async move {
            let heartbeat_loop = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(StdDuration::from_millis(interval_ms));
                ticker.tick().await; // first tick fires immediately; consume it
                loop {
                    ticker.tick().await;
                    if heartbeat_tx.send(Message::Heartbeat).await.is_err() {
                        break;
                    }
                }
            });
            controller.run().await;
            heartbeat_loop.abort();
        });

        Ok((ControllerHandle { tx }, join))
    }

    /// Startup sequence: purge stale/unverified instances, then warm up to the floor.
    async fn init(&mut self) -> Result<()> {
        self.registry.migrate(self.config.max_instances)?;

        let cleaned = self.instance_manager.cleanup_stale_instances().await?;
        if !cleaned.is_empty() {
            self.registry.sync_capacity()?;
            warn!(count = cleaned.len(), "purged stale instances at startup");
        }

        info!(interval_ms = self.config.heartbeat_interval_ms, "heartbeat scheduled");

        // Fill up to the floor rather than unconditionally adding
        // `minInstances` instances, so a restart that finds the registry
        // already at (or above) the floor warms up nothing further.
        while self.registry.get_instance_count(false)? < self.config.min_instances {
            if !self.registry.try_reserve_slot()? {
                break;
            }
            match self.instance_manager.create_instance().await {
                Ok(handle) => {
                    let name = handle.name().to_string();
                    self.registry.record_instance(&name, 0, true, Utc::now())?;
                    self.handles.insert(name, handle);
                }
                Err(e) => {
                    warn!(error = %e, "warm-up instance creation failed, releasing slot");
                    self.registry.release_slot()?;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn run(&mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                Message::Fetch {
                    path,
                    is_monitoring_get,
                    respond_to,
                } => {
                    let result = self.handle_fetch(&path, is_monitoring_get).await;
                    let _ = respond_to.send(result);
                }
                Message::Snapshot { respond_to } => {
                    let result = self.handle_snapshot();
                    let _ = respond_to.send(result);
                }
                Message::Heartbeat => {
                    if let Err(e) = self.run_heartbeat().await {
                        warn!(error = %e, "heartbeat pass failed");
                    }
                }
                Message::OptimisticScaleUp => {
                    self.dispatch_optimistic_scale_up().await;
                }
                Message::Decrement(name) => {
                    if let Err(e) = self.registry.decrement_requests(&name, Utc::now()) {
                        warn!(error = %e, instance = %name, "decrement failed");
                    }
                }
                Message::Shutdown => break,
            }
        }
    }

    fn handle_snapshot(&self) -> Result<MonitoringSnapshot> {
        let instances = self.registry.get_instances(InstanceFilter::default())?;
        Ok(MonitoringSnapshot {
            instance_count: instances.len() as i64,
            instances,
        })
    }

    /// Routes an incoming request through the full fetch pipeline: snapshot
    /// interception, instance selection, cold-start-or-reject, forwarding,
    /// bookkeeping, and optimistic scale-up detection.
    #[instrument(skip(self))]
    async fn handle_fetch(&mut self, path: &str, is_monitoring_get: bool) -> Result<FetchOutcome> {
        // Step 1: monitoring endpoint short-circuit.
        if is_monitoring_get && path == self.config.monitoring_endpoint {
            let snapshot = self.handle_snapshot()?;
            let body = serde_json::to_vec(&snapshot)?;
            return Ok(FetchOutcome::Forwarded { status: 200, body });
        }

        // Step 2: select or reserve+create.
        let selected = self.router.select_instance()?;
        let (name, _rec) = match selected {
            Some(rec) => (rec.name.clone(), rec),
            None => match self.try_cold_start().await? {
                Some(rec) => (rec.name.clone(), rec),
                None => {
                    metrics::counter!("fleet_requests_rejected_total").increment(1);
                    return Ok(FetchOutcome::ServiceUnavailable { retry_after_secs: Some(5) });
                }
            },
        };

        // Step 3: resolve the runtime handle, retrying stale cleanup once.
        let handle = match self.handles.get(&name).cloned() {
            Some(h) => h,
            None => {
                self.instance_manager.cleanup_stale_instances().await?;
                match self.handles.get(&name).cloned() {
                    Some(h) => h,
                    None => {
                        metrics::counter!("fleet_requests_rejected_total").increment(1);
                        return Ok(FetchOutcome::ServiceUnavailable { retry_after_secs: None });
                    }
                }
            }
        };

        // Step 4: ensure running|healthy, else replace or create alongside.
        let status_ok = matches!(
            handle.state().await,
            Ok(crate::instance_manager::RuntimeStatus::Running) | Ok(crate::instance_manager::RuntimeStatus::Healthy)
        );
        let handle = if status_ok {
            handle
        } else if self.registry.try_reserve_slot()? {
            // A fresh instance is being created alongside this one, but the
            // stale instance itself must stop being selectable or the
            // Router will re-select it on the very next request, since its
            // `active_requests` never grows when requests are rerouted
            // around it.
            self.registry
                .update_health(&name, false, self.config.health_check_retries, Utc::now())?;
            self.handles.remove(&name);
            match self.instance_manager.create_instance().await {
                Ok(new_handle) => {
                    let new_name = new_handle.name().to_string();
                    self.registry.record_instance(&new_name, 0, true, Utc::now())?;
                    self.handles.insert(new_name, new_handle.clone());
                    new_handle
                }
                Err(e) => {
                    self.registry.release_slot()?;
                    warn!(error = %e, "replacement creation failed");
                    metrics::counter!("fleet_requests_rejected_total").increment(1);
                    return Ok(FetchOutcome::ServiceUnavailable { retry_after_secs: Some(5) });
                }
            }
        } else {
            match self.instance_manager.replace_instance(handle.as_ref(), &name).await {
                Ok(new_handle) => {
                    let new_name = new_handle.name().to_string();
                    self.registry.record_instance(&new_name, 0, true, Utc::now())?;
                    self.handles.remove(&name);
                    self.handles.insert(new_name, new_handle.clone());
                    new_handle
                }
                Err(e) => {
                    warn!(error = %e, "in-place replacement failed");
                    metrics::counter!("fleet_requests_rejected_total").increment(1);
                    return Ok(FetchOutcome::ServiceUnavailable { retry_after_secs: Some(5) });
                }
            }
        };
        let name = handle.name().to_string();

        // Step 5.
        let now = Utc::now();
        let previous = self.registry.increment_requests(&name, now, true, 1)?;
        metrics::counter!("fleet_requests_total").increment(1);

        // Step 6: optimistic scale-up. Enqueued rather than awaited here so
        // it never adds latency to the response this request is waiting on.
        if self.router.check_optimistic_scale_up(previous) {
            let _ = self.self_tx.try_send(Message::OptimisticScaleUp);
        }

        // Step 7 & 8: forward, then always decrement (detached).
        let result = handle.container_fetch(path).await;
        self.dispatch_decrement(name);

        match result {
            Ok(resp) => Ok(FetchOutcome::Forwarded {
                status: resp.status,
                body: resp.body,
            }),
            Err(e) => {
                warn!(error = %e, "forward to container failed");
                Ok(FetchOutcome::InternalError)
            }
        }
    }

    async fn try_cold_start(&mut self) -> Result<Option<crate::model::InstanceRecord>> {
        if !self.registry.try_reserve_slot()? {
            return Ok(None);
        }
        match self.instance_manager.create_instance().await {
            Ok(handle) => {
                let name = handle.name().to_string();
                let now = Utc::now();
                self.registry.record_instance(&name, 0, true, now)?;
                self.handles.insert(name.clone(), handle);
                Ok(self.registry.get_instance_by_name(&name)?)
            }
            Err(e) => {
                self.registry.release_slot()?;
                warn!(error = %e, "cold-start creation failed");
                Ok(None)
            }
        }
    }

    /// Detached: reserve → create → track → `recordScaleUp`; release the
    /// slot on failure. Modeled as an additional cooperative step queued on
    /// the same actor, not a raw spawned task, so it never races
    /// the actor's own state.
    async fn dispatch_optimistic_scale_up(&mut self) {
        if !matches!(self.registry.try_reserve_slot(), Ok(true)) {
            return;
        }
        match self.instance_manager.create_instance().await {
            Ok(handle) => {
                let name = handle.name().to_string();
                let now = Utc::now();
                if self.registry.record_instance(&name, 0, true, now).is_ok() {
                    self.handles.insert(name, handle);
                    let _ = self.registry.record_scale_up(now);
                    metrics::counter!("fleet_scale_up_total").increment(1);
                    info!("optimistic scale-up completed");
                }
            }
            Err(e) => {
                warn!(error = %e, "optimistic scale-up creation failed");
                let _ = self.registry.release_slot();
            }
        }
    }

    fn dispatch_decrement(&self, name: String) {
        let _ = self.self_tx.try_send(Message::Decrement(name));
    }

    /// Periodic reconciliation: refresh metrics and health, decide whether to
    /// scale up or down, advance draining instances, and purge stale ones.
    #[instrument(skip(self))]
    async fn run_heartbeat(&mut self) -> Result<()> {
        let now = Utc::now();

        // Step 1.
        let cleaned = self.instance_manager.cleanup_stale_instances().await?;
        for name in &cleaned {
            self.handles.remove(name);
        }
        self.purge_by_heartbeat_age(now)?;
        if !cleaned.is_empty() {
            self.registry.sync_capacity()?;
        }

        // Step 2.
        self.instance_manager.keep_alive().await?;

        // Step 3.
        let instances = self.registry.get_instances(InstanceFilter::default())?;
        for inst in &instances {
            if inst.draining {
                continue;
            }
            let still_healthy = self.instance_manager.perform_health_check(&inst.name).await.unwrap_or(false);
            if still_healthy {
                if let Ok(payload) = self.instance_manager.fetch_monitorz(&inst.name).await {
                    self.registry.update_metrics(
                        &inst.name,
                        payload.cpu_usage,
                        payload.memory_usage,
                        payload.disk_usage,
                    )?;
                }
            }
        }

        // Step 4.
        if self.scaler.should_scale_up_for_metrics(now)? || self.scaler.should_scale_up_for_requests(now)? {
            if self.registry.try_reserve_slot()? {
                match self.instance_manager.create_instance().await {
                    Ok(handle) => {
                        let name = handle.name().to_string();
                        self.registry.record_instance(&name, 0, true, now)?;
                        self.handles.insert(name, handle);
                        self.registry.record_scale_up(now)?;
                        metrics::counter!("fleet_scale_up_total").increment(1);
                        info!("scale-up completed from heartbeat");
                    }
                    Err(e) => {
                        warn!(error = %e, "heartbeat scale-up creation failed");
                        self.registry.release_slot()?;
                    }
                }
            }
        }

        // Step 5.
        if self.scaler.should_scale_down(now)? {
            let candidates = self.scaler.select_instances_for_removal()?;
            let mut drained_any = false;
            for inst in candidates {
                self.drain_instance(&inst.name, now).await?;
                drained_any = true;
            }
            if drained_any {
                self.registry.record_scale_down(now)?;
                metrics::counter!("fleet_scale_down_total").increment(1);
            }
        }

        // Step 6: process existing draining instances.
        let drain_timeout = Duration::milliseconds(self.config.drain_timeout_ms as i64);
        let draining: Vec<_> = self
            .registry
            .get_instances(InstanceFilter::default())?
            .into_iter()
            .filter(|i| i.draining)
            .collect();
        for inst in draining {
            let timed_out = inst
                .draining_since
                .is_some_and(|since| now - since >= drain_timeout);
            if inst.active_requests == 0 || timed_out {
                if timed_out && inst.active_requests > 0 {
                    warn!(
                        instance = %inst.name,
                        abandoned_requests = inst.active_requests,
                        "drain timeout exceeded with in-flight requests"
                    );
                }
                if let Some(handle) = self.handles.remove(&inst.name) {
                    let _ = self.instance_manager.destroy_instance(handle.as_ref(), &inst.name).await;
                } else {
                    let _ = self.registry.remove_instance(&inst.name);
                }
            }
        }

        // Step 7: publish fleet-wide gauges for this reconciliation pass.
        let instances = self.registry.get_instances(InstanceFilter::default())?;
        let capacity = self.registry.get_capacity()?;
        crate::metrics::record_fleet_gauges(&instances, capacity.current_count, capacity.max_count);
        Ok(())
    }

    /// `staleThreshold` is informational, but also used here to purge any
    /// instance whose heartbeat has gone silent for that long.
    fn purge_by_heartbeat_age(&mut self, now: DateTime<Utc>) -> Result<()> {
        let stale_after = Duration::milliseconds(self.config.stale_threshold_ms as i64);
        let instances = self.registry.get_instances(InstanceFilter::default())?;
        for inst in instances {
            if now - inst.last_heartbeat > stale_after {
                warn!(instance = %inst.name, "purging instance stale by heartbeat age");
                self.handles.remove(&inst.name);
                self.registry.remove_instance(&inst.name)?;
            }
        }
        Ok(())
    }

    /// Marks an instance draining so it stops receiving new requests while
    /// in-flight ones complete.
    async fn drain_instance(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(inst) = self.registry.get_instance_by_name(name)? else {
            return Ok(());
        };
        if !inst.draining {
            self.registry.mark_draining(name, now)?;
            return Ok(());
        }
        let timed_out = inst
            .draining_since
            .is_some_and(|since| now - since >= Duration::milliseconds(self.config.drain_timeout_ms as i64));
        if inst.active_requests == 0 || timed_out {
            if timed_out && inst.active_requests > 0 {
                warn!(instance = name, in_flight = inst.active_requests, "draining instance forcibly destroyed after timeout");
            }
            if let Some(handle) = self.handles.remove(name) {
                self.instance_manager.destroy_instance(handle.as_ref(), name).await?;
            } else {
                self.registry.remove_instance(name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_manager::MockContainerRuntime;

    async fn spawn_test_controller(config: Config) -> (ControllerHandle, Arc<Registry>) {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let runtime = Arc::new(MockContainerRuntime::default());
        let (handle, _join) = Controller::spawn(registry.clone(), runtime, config).await.unwrap();
        (handle, registry)
    }

    #[tokio::test]
    async fn cold_start_warms_up_to_min_instances() {
        let mut config = Config::default();
        config.min_instances = 2;
        config.max_instances = 5;
        let (_handle, registry) = spawn_test_controller(config).await;
        assert_eq!(registry.get_instance_count(false).unwrap(), 2);
        assert_eq!(registry.get_capacity().unwrap().current_count, 2);
    }

    #[tokio::test]
    async fn monitoring_endpoint_returns_snapshot() {
        let mut config = Config::default();
        config.min_instances = 1;
        let (handle, _registry) = spawn_test_controller(config.clone()).await;
        let outcome = handle.fetch(&config.monitoring_endpoint, true).await.unwrap();
        match outcome {
            FetchOutcome::Forwarded { status, body } => {
                assert_eq!(status, 200);
                let snapshot: MonitoringSnapshot = serde_json::from_slice(&body).unwrap();
                assert_eq!(snapshot.instance_count, 1);
            }
            _ => panic!("expected a forwarded snapshot response"),
        }
    }

    #[tokio::test]
    async fn fetch_with_no_instances_and_no_capacity_returns_503() {
        let mut config = Config::default();
        config.min_instances = 0;
        config.max_instances = 0;
        let (handle, _registry) = spawn_test_controller(config).await;
        let outcome = handle.fetch("/anything", false).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn request_decrement_is_visible_after_response() {
        let mut config = Config::default();
        config.min_instances = 1;
        let (handle, registry) = spawn_test_controller(config).await;

        handle.fetch("/anything", false).await.unwrap();
        // Decrement is self-queued; give the actor a turn to process it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let instances = registry.get_instances(Default::default()).unwrap();
        assert_eq!(instances[0].active_requests, 0);
    }
}
