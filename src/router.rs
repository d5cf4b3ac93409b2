//! Request routing: pure, reads the Registry, no side effects.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::model::{InstanceFilter, InstanceRecord};
use crate::registry::Registry;

pub struct Router {
    registry: Arc<Registry>,
    config: Config,
}

impl Router {
    pub fn new(registry: Arc<Registry>, config: Config) -> Self {
        Self { registry, config }
    }

    /// Prefers a healthy, non-draining instance below `maxRequestsPerInstance`
    /// (if configured); falls back to any healthy non-draining instance.
    /// Ordering: fewest `active_requests`, ties by most recent `last_heartbeat`
    /// — `Registry::get_instances` already returns rows in that order.
    pub fn select_instance(&self) -> Result<Option<InstanceRecord>> {
        if let Some(cap) = self.config.max_requests_per_instance {
            let mut filter = InstanceFilter::healthy_not_draining();
            filter.below_capacity = Some(cap);
            let candidates = self.registry.get_instances(filter)?;
            if let Some(rec) = candidates.into_iter().next() {
                return Ok(Some(rec));
            }
        }
        let candidates = self.registry.get_instances(InstanceFilter::healthy_not_draining())?;
        Ok(candidates.into_iter().next())
    }

    /// True iff `maxRequestsPerInstance` is configured and the transition
    /// `previous → previous+1` crosses `floor(max × scaleUpCapacityThreshold)`
    /// from below. Edge-triggered: fires at most once per crossing.
    pub fn check_optimistic_scale_up(&self, previous_active_requests: i64) -> bool {
        let Some(max) = self.config.max_requests_per_instance else {
            return false;
        };
        let limit = (max as f32 * self.config.scale_up_capacity_threshold).floor() as i64;
        previous_active_requests < limit && previous_active_requests + 1 >= limit
    }

    pub fn get_at_capacity_count(&self) -> Result<i64> {
        let Some(max) = self.config.max_requests_per_instance else {
            return Ok(0);
        };
        let instances = self.registry.get_instances(InstanceFilter::healthy_not_draining())?;
        Ok(instances.iter().filter(|i| i.active_requests >= max).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn router_with(cap: Option<i64>) -> Router {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let mut config = Config::default();
        config.max_requests_per_instance = cap;
        registry.migrate(config.max_instances).unwrap();
        Router::new(registry, config)
    }

    #[test]
    fn selects_least_loaded_instance() {
        let router = router_with(None);
        let now = Utc::now();
        router.registry.record_instance("busy", 5, true, now).unwrap();
        router.registry.record_instance("idle", 1, true, now).unwrap();
        let chosen = router.select_instance().unwrap().unwrap();
        assert_eq!(chosen.name, "idle");
    }

    #[test]
    fn never_selects_draining_instance() {
        let router = router_with(None);
        let now = Utc::now();
        router.registry.record_instance("only", 0, true, now).unwrap();
        router.registry.mark_draining("only", now).unwrap();
        assert!(router.select_instance().unwrap().is_none());
    }

    #[test]
    fn optimistic_crossing_fires_once_at_the_edge() {
        let router = router_with(Some(10));
        // limit = floor(10 * 0.7) = 7
        assert!(!router.check_optimistic_scale_up(5));
        assert!(router.check_optimistic_scale_up(6));
        assert!(!router.check_optimistic_scale_up(7));
    }

    #[test]
    fn optimistic_crossing_disabled_without_max_requests_configured() {
        let router = router_with(None);
        assert!(!router.check_optimistic_scale_up(6));
    }
}
