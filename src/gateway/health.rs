//! Health and maintenance reports.

use serde::Serialize;

use crate::cache::CacheStats;
use crate::limiter::LimiterStats;
use crate::queue::QueueStats;

/// Overall service status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Reachability of the inference backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealth {
    pub name: String,
    pub status: BackendStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of every component, suitable for a health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub backend: BackendHealth,
    pub queue: QueueStats,
    pub caches: Vec<CacheStats>,
    pub limiters: Vec<LimiterStats>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// What one maintenance sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_search_entries: usize,
    pub expired_response_entries: usize,
    pub stale_clients: usize,
}

impl MaintenanceReport {
    pub fn total(&self) -> usize {
        self.expired_search_entries + self.expired_response_entries + self.stale_clients
    }
}
