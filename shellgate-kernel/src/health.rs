use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::registry::ConnectionRegistry;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub devices: u32,
    pub healthy_devices: u32,
    pub rate_limited_clients: u32,
    pub requests_served: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    requests: Arc<AtomicU64>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn get_health(&self, registry: &ConnectionRegistry, tracked_clients: usize) -> KernelHealth {
        let devices = registry.len().await as u32;
        let healthy = registry.list_healthy().await.len() as u32;

        KernelHealth {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices,
            healthy_devices: healthy,
            rate_limited_clients: tracked_clients as u32,
            requests_served: self.requests.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
