//! Data model: `InstanceRecord`, `CapacityCounter`, `ScalingState`, and the
//! DTOs exposed at the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per known container instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub active_requests: i64,
    pub current_cpu: f32,
    pub current_memory: f32,
    pub current_disk: f32,
    pub healthy: bool,
    pub health_check_failures: i64,
    pub last_heartbeat: DateTime<Utc>,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub draining: bool,
    pub draining_since: Option<DateTime<Utc>>,
    pub threshold_crossed_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn new(name: impl Into<String>, initial_requests: i64, healthy: bool, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            created_at: now,
            active_requests: initial_requests.max(0),
            current_cpu: 0.0,
            current_memory: 0.0,
            current_disk: 0.0,
            healthy,
            health_check_failures: 0,
            last_heartbeat: now,
            last_request_at: None,
            last_health_check: None,
            draining: false,
            draining_since: None,
            threshold_crossed_at: None,
        }
    }

    /// A draining instance is never eligible for selection.
    pub fn routable(&self) -> bool {
        self.healthy && !self.draining
    }

    /// The lifecycle state this record currently occupies: `Healthy` ->
    /// `Unhealthy` (health-check failures) or `Draining` (selected for
    /// removal) -> removed once drained or timed out. Derived from
    /// `healthy`/`draining` rather than stored directly, since both flags
    /// are independently updated by different call sites and must never
    /// drift out of sync with each other.
    pub fn status(&self) -> InstanceStatus {
        if self.draining {
            InstanceStatus::Draining
        } else if self.healthy {
            InstanceStatus::Healthy
        } else {
            InstanceStatus::Unhealthy
        }
    }
}

/// The instance lifecycle state machine: a `Healthy` instance moves to
/// `Unhealthy` on repeated health-check failures or to `Draining` once
/// selected for scale-down removal; both terminate in the record being
/// removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
    Draining,
}

/// Filter predicates accepted by `Registry::get_instances`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceFilter {
    pub healthy: Option<bool>,
    pub not_draining: bool,
    pub below_capacity: Option<i64>,
}

impl InstanceFilter {
    pub fn healthy_not_draining() -> Self {
        Self {
            healthy: Some(true),
            not_draining: true,
            below_capacity: None,
        }
    }
}

/// Single-row atomic reservation slot capping instance creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityCounter {
    pub current_count: i64,
    pub max_count: i64,
}

/// Single-row global scale-action timestamps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ScalingState {
    pub last_scale_up: Option<DateTime<Utc>>,
    pub last_scale_down: Option<DateTime<Utc>>,
}

/// Response body for the monitoring endpoint, served from the same entry
/// surface as forwarded requests.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    #[serde(rename = "instanceCount")]
    pub instance_count: i64,
    pub instances: Vec<InstanceRecord>,
}

/// The resolved threshold policy: a general threshold applied to every
/// metric, or per-metric thresholds, never a loosely-typed mix of both.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdPolicy {
    None,
    General(f32),
    Specific { cpu: f32, memory: f32, disk: f32 },
}

impl ThresholdPolicy {
    /// Per-metric thresholds this policy implies, or `None` if that metric
    /// has no threshold configured (e.g. a `Specific` scale-down policy
    /// derived only from some of the scale-up metrics).
    pub fn for_metric(&self, metric: Metric) -> Option<f32> {
        match self {
            ThresholdPolicy::None => None,
            ThresholdPolicy::General(v) => Some(*v),
            ThresholdPolicy::Specific { cpu, memory, disk } => Some(match metric {
                Metric::Cpu => *cpu,
                Metric::Memory => *memory,
                Metric::Disk => *disk,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cpu,
    Memory,
    Disk,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_record_is_routable_when_healthy() {
        let rec = InstanceRecord::new("inst-1", 0, true, Utc::now());
        assert!(rec.routable());
    }

    #[test]
    fn draining_instance_is_never_routable() {
        let mut rec = InstanceRecord::new("inst-1", 0, true, Utc::now());
        rec.draining = true;
        assert!(!rec.routable());
    }

    #[test]
    fn general_policy_applies_to_every_metric() {
        let p = ThresholdPolicy::General(75.0);
        assert_eq!(p.for_metric(Metric::Cpu), Some(75.0));
        assert_eq!(p.for_metric(Metric::Disk), Some(75.0));
    }

    #[test]
    fn status_reflects_draining_over_healthy() {
        let mut rec = InstanceRecord::new("inst-1", 0, true, Utc::now());
        assert_eq!(rec.status(), InstanceStatus::Healthy);
        rec.draining = true;
        assert_eq!(rec.status(), InstanceStatus::Draining);
        rec.draining = false;
        rec.healthy = false;
        assert_eq!(rec.status(), InstanceStatus::Unhealthy);
    }
}
