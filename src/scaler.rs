//! Scaler: pure policy, reads Registry + config. Implements
//! threshold/request-based scale-up, hysteresis scale-down, and instance
//! selection for removal.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::model::{InstanceFilter, InstanceRecord, Metric, ThresholdPolicy};
use crate::registry::Registry;

pub struct Scaler {
    registry: Arc<Registry>,
    config: Config,
}

impl Scaler {
    pub fn new(registry: Arc<Registry>, config: Config) -> Self {
        Self { registry, config }
    }

    /// Scans healthy non-draining instances for a metric threshold crossing.
    /// Returns `true` and records `markThresholdCrossed` on the first
    /// instance found eligible (its own `threshold_crossed_at` absent or
    /// older than `scaleUpCooldown`).
    pub fn should_scale_up_for_metrics(&self, now: DateTime<Utc>) -> Result<bool> {
        let count = self.registry.get_instance_count(false)?;
        if count >= self.config.max_instances {
            return Ok(false);
        }
        if self.in_scale_up_cooldown(now)? {
            return Ok(false);
        }
        let policy = self.config.threshold_policy();
        if matches!(policy, ThresholdPolicy::None) {
            return Ok(false);
        }

        let cooldown = Duration::milliseconds(self.config.scale_up_cooldown_ms as i64);
        let instances = self.registry.get_instances(InstanceFilter::healthy_not_draining())?;

        for inst in &instances {
            let eligible = match inst.threshold_crossed_at {
                None => true,
                Some(t) => now - t >= cooldown,
            };
            if !eligible {
                continue;
            }
            if metric_exceeds(&policy, Metric::Cpu, inst.current_cpu)
                || metric_exceeds(&policy, Metric::Memory, inst.current_memory)
                || metric_exceeds(&policy, Metric::Disk, inst.current_disk)
            {
                self.registry.mark_threshold_crossed(&inst.name, now)?;
                info!(instance = %inst.name, "metric threshold crossed, scale-up triggered");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Requires `maxRequestsPerInstance` configured, not in cooldown, not at
    /// max. True iff average `active_requests` across healthy non-draining
    /// instances exceeds the configured limit.
    pub fn should_scale_up_for_requests(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(max) = self.config.max_requests_per_instance else {
            return Ok(false);
        };
        let count = self.registry.get_instance_count(false)?;
        if count >= self.config.max_instances {
            return Ok(false);
        }
        if self.in_scale_up_cooldown(now)? {
            return Ok(false);
        }
        let instances = self.registry.get_instances(InstanceFilter::healthy_not_draining())?;
        if instances.is_empty() {
            return Ok(false);
        }
        let total: i64 = instances.iter().map(|i| i.active_requests).sum();
        let average = total as f64 / instances.len() as f64;
        Ok(average > max as f64)
    }

    /// Requires `count > minInstances` and not in scale-down cooldown.
    /// True iff every healthy non-draining instance is at or below the
    /// (hysteresis-derived) scale-down thresholds.
    pub fn should_scale_down(&self, now: DateTime<Utc>) -> Result<bool> {
        let count = self.registry.get_instance_count(false)?;
        if count <= self.config.min_instances {
            return Ok(false);
        }
        if self.in_scale_down_cooldown(now)? {
            return Ok(false);
        }
        let policy = self.config.scale_down_policy();
        if matches!(policy, ThresholdPolicy::None) {
            return Ok(false);
        }
        let instances = self.registry.get_instances(InstanceFilter::healthy_not_draining())?;
        if instances.is_empty() {
            return Ok(false);
        }
        Ok(instances.iter().all(|inst| {
            metric_at_or_below(&policy, Metric::Cpu, inst.current_cpu)
                && metric_at_or_below(&policy, Metric::Memory, inst.current_memory)
                && metric_at_or_below(&policy, Metric::Disk, inst.current_disk)
        }))
    }

    /// First all non-draining unhealthy instances, then healthy non-draining
    /// instances below scale-down thresholds ordered oldest-first
    /// (`active_requests ASC, last_heartbeat ASC`), capped at
    /// `count - minInstances` total removals.
    pub fn select_instances_for_removal(&self) -> Result<Vec<InstanceRecord>> {
        let total = self.registry.get_instance_count(false)?;
        let budget = (total - self.config.min_instances).max(0);
        if budget == 0 {
            return Ok(Vec::new());
        }

        let mut removals = Vec::new();

        let unhealthy = self.registry.get_instances(InstanceFilter {
            healthy: Some(false),
            not_draining: true,
            below_capacity: None,
        })?;
        removals.extend(unhealthy);

        if (removals.len() as i64) < budget {
            let policy = self.config.scale_down_policy();
            let mut healthy = self.registry.get_instances(InstanceFilter::healthy_not_draining())?;
            healthy.retain(|inst| {
                metric_at_or_below(&policy, Metric::Cpu, inst.current_cpu)
                    && metric_at_or_below(&policy, Metric::Memory, inst.current_memory)
                    && metric_at_or_below(&policy, Metric::Disk, inst.current_disk)
            });
            healthy.sort_by(|a, b| {
                a.active_requests
                    .cmp(&b.active_requests)
                    .then(a.last_heartbeat.cmp(&b.last_heartbeat))
            });
            removals.extend(healthy);
        }

        removals.truncate(budget as usize);
        Ok(removals)
    }

    fn in_scale_up_cooldown(&self, now: DateTime<Utc>) -> Result<bool> {
        let state = self.registry.get_scaling_state()?;
        let cooldown = Duration::milliseconds(self.config.scale_up_cooldown_ms as i64);
        Ok(state.last_scale_up.is_some_and(|t| now - t < cooldown))
    }

    fn in_scale_down_cooldown(&self, now: DateTime<Utc>) -> Result<bool> {
        let state = self.registry.get_scaling_state()?;
        let cooldown = Duration::milliseconds(self.config.scale_down_cooldown_ms as i64);
        Ok(state.last_scale_down.is_some_and(|t| now - t < cooldown))
    }
}

fn metric_exceeds(policy: &ThresholdPolicy, metric: Metric, value: f32) -> bool {
    policy.for_metric(metric).is_some_and(|threshold| value > threshold)
}

fn metric_at_or_below(policy: &ThresholdPolicy, metric: Metric, value: f32) -> bool {
    match policy.for_metric(metric) {
        Some(threshold) => value <= threshold,
        None => true,
    }
}
