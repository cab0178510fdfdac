//! Metrics module
//!
//! Process-wide Prometheus metrics for health checks, remounts, lease
//! renewals and export state, registered on the default registry.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder};

use crate::error::{Error, Result};

/// Health check outcomes by result (`healthy`, `read_only`, `unhealthy`)
pub static HEALTH_CHECKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "share_manager_health_checks_total",
        "Total number of mount health checks",
        &["result"]
    )
    .expect("health check metric registers once")
});

/// Read-write remount attempts by result (`success`, `failure`)
pub static REMOUNT_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "share_manager_remount_attempts_total",
        "Total number of read-write remount attempts",
        &["result"]
    )
    .expect("remount metric registers once")
});

/// Lease writes by operation (`take`, `renew`) and result (`success`, `failure`)
pub static LEASE_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "share_manager_lease_updates_total",
        "Total number of failover lease writes",
        &["operation", "result"]
    )
    .expect("lease metric registers once")
});

/// 1 while the volume is exported
pub static EXPORT_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "share_manager_export_active",
        "Whether the volume is currently exported"
    )
    .expect("export metric registers once")
});

/// Label value for a success/failure outcome.
pub fn outcome<T, E>(result: &std::result::Result<T, E>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "failure"
    }
}

/// Force registration so every metric shows up on the first scrape.
pub fn register() {
    Lazy::force(&HEALTH_CHECKS);
    Lazy::force(&REMOUNT_ATTEMPTS);
    Lazy::force(&LEASE_UPDATES);
    Lazy::force(&EXPORT_ACTIVE);
}

/// Encode the default registry in the Prometheus text format.
pub fn encode() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("failed to encode metrics: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}
