//! InstanceManager: wraps the external container runtime. All
//! methods are async and can fail; failures are logged and, where noted,
//! cause registry corrections.
//!
//! `ContainerRuntime` is the consumed contract — the container runtime
//! itself is out of scope, so this module only defines the trait
//! boundary and a `MockContainerRuntime` test double.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ControllerError, Result};
use crate::model::InstanceFilter;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Running,
    Healthy,
    NotFound,
    Other,
}

/// A handle to a live container, as exposed by the runtime's namespace API
/// (`namespace.getByName(name) -> handle`).
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    fn name(&self) -> &str;
    async fn state(&self) -> Result<RuntimeStatus>;
    async fn container_fetch(&self, path: &str) -> Result<ContainerResponse>;
    async fn destroy(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ContainerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The external container runtime: a consumed contract, not implemented here.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Result<Option<Arc<dyn ContainerHandle>>>;
    async fn create(&self, name: &str) -> Result<Arc<dyn ContainerHandle>>;
}

#[derive(Debug, Deserialize)]
pub struct MonitorzPayload {
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub disk_usage: f32,
}

pub struct InstanceManager {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    config: Config,
}

impl InstanceManager {
    pub fn new(registry: Arc<Registry>, runtime: Arc<dyn ContainerRuntime>, config: Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(5))
            .build()
            .expect("reqwest client builds with static config");
        Self {
            registry,
            runtime,
            http,
            config,
        }
    }

    /// Mint a fresh random id, start the container, wait for ports, return
    /// a handle. Does not touch the registry — the caller records the
    /// instance once it is confirmed ready, per the Controller's init/
    /// scale-up sequencing.
    #[instrument(skip(self))]
    pub async fn create_instance(&self) -> Result<Arc<dyn ContainerHandle>> {
        let name = format!("instance-{}", Uuid::new_v4());
        let handle = self
            .runtime
            .create(&name)
            .await
            .map_err(|e| ControllerError::RuntimeTransient(e.to_string()))?;
        metrics::counter!("fleet_instances_created_total").increment(1);
        info!(instance = %name, "container instance created");
        Ok(handle)
    }

    /// Best-effort destroy; always removes the registry record, even if the
    /// destroy call itself fails.
    #[instrument(skip(self, handle))]
    pub async fn destroy_instance(&self, handle: &dyn ContainerHandle, name: &str) -> Result<()> {
        if let Err(e) = handle.destroy().await {
            warn!(instance = name, error = %e, "destroy call failed, removing registry record anyway");
        }
        self.registry.remove_instance(name)?;
        metrics::counter!("fleet_instances_destroyed_total").increment(1);
        Ok(())
    }

    /// destroy + create, used when a selected instance is unhealthy and no
    /// slot could be reserved to create a fresh replacement alongside it.
    #[instrument(skip(self, old_handle))]
    pub async fn replace_instance(&self, old_handle: &dyn ContainerHandle, old_name: &str) -> Result<Arc<dyn ContainerHandle>> {
        self.destroy_instance(old_handle, old_name).await?;
        self.create_instance().await
    }

    /// GET the monitoring endpoint. On success, reset failures/healthy. On
    /// failure, increment failures; mark unhealthy at `healthCheckRetries`.
    #[instrument(skip(self))]
    pub async fn perform_health_check(&self, name: &str) -> Result<bool> {
        let url = format!("http://{name}{}", self.config.monitoring_endpoint);
        let now = Utc::now();
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.registry.update_health(name, true, 0, now)?;
                Ok(true)
            }
            _ => {
                let current = self.registry.get_instance_by_name(name)?;
                let failures = current.map(|r| r.health_check_failures + 1).unwrap_or(1);
                let healthy = failures < self.config.health_check_retries;
                self.registry.update_health(name, healthy, failures, now)?;
                metrics::counter!("fleet_health_check_failures_total").increment(1);
                if !healthy {
                    warn!(instance = name, failures, "instance marked unhealthy");
                }
                Ok(healthy)
            }
        }
    }

    /// GET the monitorz endpoint on this instance's own host (scheme, port,
    /// and path taken from `monitorzURL`, host swapped for `name`); expects
    /// JSON `{cpu_usage, memory_usage, disk_usage}`.
    #[instrument(skip(self))]
    pub async fn fetch_monitorz(&self, name: &str) -> Result<MonitorzPayload> {
        let mut url = reqwest::Url::parse(&self.config.monitorz_url)
            .map_err(|e| ControllerError::RuntimeTransient(e.to_string()))?;
        url.set_host(Some(name))
            .map_err(|e| ControllerError::RuntimeTransient(e.to_string()))?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ControllerError::RuntimeTransient(e.to_string()))?;
        resp.json::<MonitorzPayload>()
            .await
            .map_err(|e| ControllerError::RuntimeTransient(e.to_string()))
            .inspect_err(|_| warn!(instance = name, "monitorz fetch failed"))
    }

    /// Fire-and-forget hit to the monitoring endpoint for each healthy
    /// non-draining instance; updates `last_heartbeat` per success. Draining
    /// instances are excluded definitively — once draining, always skipped.
    #[instrument(skip(self))]
    pub async fn keep_alive(&self) -> Result<()> {
        let instances = self.registry.get_instances(InstanceFilter::healthy_not_draining())?;
        for inst in instances {
            let url = format!("http://{}{}", inst.name, self.config.monitoring_endpoint);
            if self.http.get(&url).send().await.is_ok() {
                self.registry.update_heartbeat(&inst.name, Utc::now())?;
            } else {
                debug!(instance = %inst.name, "keep-alive probe failed");
            }
        }
        Ok(())
    }

    /// For each registered instance, probe the runtime for its state; on
    /// "not found", remove the record. Returns the list of cleaned names.
    #[instrument(skip(self))]
    pub async fn cleanup_stale_instances(&self) -> Result<Vec<String>> {
        let instances = self.registry.get_instances(InstanceFilter::default())?;
        let mut cleaned = Vec::new();
        for inst in instances {
            match self.runtime.get_by_name(&inst.name).await {
                Ok(None) => {
                    self.registry.remove_instance(&inst.name)?;
                    cleaned.push(inst.name.clone());
                }
                Ok(Some(handle)) => {
                    if matches!(handle.state().await, Ok(RuntimeStatus::NotFound)) {
                        self.registry.remove_instance(&inst.name)?;
                        cleaned.push(inst.name.clone());
                    }
                }
                Err(_) => {
                    // RuntimeTransient: leave the record, next heartbeat retries.
                }
            }
        }
        if !cleaned.is_empty() {
            info!(count = cleaned.len(), "cleaned up stale instances");
        }
        Ok(cleaned)
    }
}

/// Thin HTTP adapter onto an external provisioning webhook, in the style of
/// `orchestrator-node`'s self-healing webhook POSTs: creation/destruction
/// are delegated to `provisioning_webhook_url`, and liveness is inferred
/// from reachability of the instance's own monitoring endpoint. This is the
/// only concrete `ContainerRuntime` shipped — the real container runtime's
/// internals remain out of scope, so this adapter is deliberately
/// thin: it does not implement namespace lookup beyond a liveness probe.
pub struct HttpContainerRuntime {
    http: reqwest::Client,
    provisioning_webhook_url: String,
    monitoring_endpoint: String,
}

impl HttpContainerRuntime {
    pub fn new(provisioning_webhook_url: String, monitoring_endpoint: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(10))
                .build()
                .expect("reqwest client builds with static config"),
            provisioning_webhook_url,
            monitoring_endpoint,
        }
    }
}

pub struct HttpHandle {
    name: String,
    http: reqwest::Client,
    provisioning_webhook_url: String,
    monitoring_endpoint: String,
}

#[async_trait]
impl ContainerHandle for HttpHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn state(&self) -> Result<RuntimeStatus> {
        let url = format!("http://{}{}", self.name, self.monitoring_endpoint);
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(RuntimeStatus::Healthy),
            Ok(_) => Ok(RuntimeStatus::Other),
            Err(_) => Ok(RuntimeStatus::NotFound),
        }
    }

    async fn container_fetch(&self, path: &str) -> Result<ContainerResponse> {
        let url = format!("http://{}{}", self.name, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ControllerError::RuntimeTransient(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ControllerError::RuntimeTransient(e.to_string()))?
            .to_vec();
        Ok(ContainerResponse { status, body })
    }

    async fn destroy(&self) -> Result<()> {
        self.http
            .post(format!("{}/destroy", self.provisioning_webhook_url))
            .json(&serde_json::json!({ "name": self.name }))
            .send()
            .await
            .map_err(|e| ControllerError::RuntimeTransient(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for HttpContainerRuntime {
    async fn get_by_name(&self, name: &str) -> Result<Option<Arc<dyn ContainerHandle>>> {
        let handle = Arc::new(HttpHandle {
            name: name.to_string(),
            http: self.http.clone(),
            provisioning_webhook_url: self.provisioning_webhook_url.clone(),
            monitoring_endpoint: self.monitoring_endpoint.clone(),
        });
        match handle.state().await? {
            RuntimeStatus::NotFound => Ok(None),
            _ => Ok(Some(handle)),
        }
    }

    async fn create(&self, name: &str) -> Result<Arc<dyn ContainerHandle>> {
        self.http
            .post(format!("{}/create", self.provisioning_webhook_url))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(|e| ControllerError::RuntimeTransient(e.to_string()))?;
        Ok(Arc::new(HttpHandle {
            name: name.to_string(),
            http: self.http.clone(),
            provisioning_webhook_url: self.provisioning_webhook_url.clone(),
            monitoring_endpoint: self.monitoring_endpoint.clone(),
        }))
    }
}

/// In-memory test double for `ContainerRuntime`, fulfilling its
/// consumed contract without a real container backend.
#[derive(Default)]
pub struct MockContainerRuntime {
    instances: AsyncMutex<HashMap<String, Arc<MockHandle>>>,
}

pub struct MockHandle {
    name: String,
    destroyed: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl ContainerHandle for MockHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn state(&self) -> Result<RuntimeStatus> {
        if self.destroyed.load(std::sync::atomic::Ordering::SeqCst) {
            Ok(RuntimeStatus::NotFound)
        } else {
            Ok(RuntimeStatus::Healthy)
        }
    }

    async fn container_fetch(&self, _path: &str) -> Result<ContainerResponse> {
        Ok(ContainerResponse {
            status: 200,
            body: b"ok".to_vec(),
        })
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockContainerRuntime {
    async fn get_by_name(&self, name: &str) -> Result<Option<Arc<dyn ContainerHandle>>> {
        let instances = self.instances.lock().await;
        Ok(instances.get(name).map(|h| h.clone() as Arc<dyn ContainerHandle>))
    }

    async fn create(&self, name: &str) -> Result<Arc<dyn ContainerHandle>> {
        let handle = Arc::new(MockHandle {
            name: name.to_string(),
            destroyed: std::sync::atomic::AtomicBool::new(false),
        });
        self.instances.lock().await.insert(name.to_string(), handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_runtime_create_then_get_round_trips() {
        let runtime = MockContainerRuntime::default();
        let handle = runtime.create("x").await.unwrap();
        assert_eq!(handle.name(), "x");
        let fetched = runtime.get_by_name("x").await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn destroyed_handle_reports_not_found() {
        let runtime = MockContainerRuntime::default();
        let handle = runtime.create("x").await.unwrap();
        handle.destroy().await.unwrap();
        assert_eq!(handle.state().await.unwrap(), RuntimeStatus::NotFound);
    }
}
