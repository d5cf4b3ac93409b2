//! Prometheus metric wiring, grounded on the teacher's
//! `initialize_metrics`/`start_metrics_server` functions, retargeted at
//! fleet-scaling metric names.

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, instrument};

use crate::model::InstanceRecord;

pub fn describe_metrics() {
    describe_counter!("fleet_instances_created_total", "Total container instances created");
    describe_counter!("fleet_instances_destroyed_total", "Total container instances destroyed");
    describe_counter!("fleet_scale_up_total", "Total scale-up decisions executed");
    describe_counter!("fleet_scale_down_total", "Total scale-down decisions executed");
    describe_counter!("fleet_requests_total", "Total requests routed to an instance");
    describe_counter!("fleet_requests_rejected_total", "Total requests rejected with 503");
    describe_counter!("fleet_health_check_failures_total", "Total failed health checks");

    describe_gauge!("fleet_instance_count", "Current number of registered instances");
    describe_gauge!("fleet_healthy_instance_count", "Current number of healthy instances");
    describe_gauge!("fleet_draining_instance_count", "Current number of draining instances");
    describe_gauge!("fleet_capacity_current", "Current reserved capacity slots");
    describe_gauge!("fleet_capacity_max", "Maximum configured capacity slots");
}

pub fn record_fleet_gauges(instances: &[InstanceRecord], current_count: i64, max_count: i64) {
    let healthy = instances.iter().filter(|i| i.healthy).count() as f64;
    let draining = instances.iter().filter(|i| i.draining).count() as f64;

    metrics::gauge!("fleet_instance_count").set(instances.len() as f64);
    metrics::gauge!("fleet_healthy_instance_count").set(healthy);
    metrics::gauge!("fleet_draining_instance_count").set(draining);
    metrics::gauge!("fleet_capacity_current").set(current_count as f64);
    metrics::gauge!("fleet_capacity_max").set(max_count as f64);
}

#[instrument]
pub async fn start_metrics_server(addr: &str) {
    let addr: SocketAddr = match addr.parse() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, addr, "invalid metrics listen address");
            return;
        }
    };

    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "metrics server listening"),
        Err(e) => error!(error = %e, "failed to install prometheus exporter"),
    }
}
