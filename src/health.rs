//! Read-only liveness and backend-reachability snapshot.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::registry::{BackendHealthSnapshot, BackendRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub backend: Vec<BackendHealthSnapshot>,
    /// Seconds since the gateway started.
    pub uptime: u64,
}

#[derive(Debug, Clone)]
pub struct HealthReporter {
    registry: Arc<BackendRegistry>,
    started: Instant,
}

impl HealthReporter {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            started: Instant::now(),
        }
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            version: env!("CARGO_PKG_VERSION"),
            backend: self.registry.snapshot(),
            uptime: self.started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    #[test]
    fn test_report_shape() {
        let registry = Arc::new(BackendRegistry::from_config(&GatewayConfig::default()).unwrap());
        registry.record_failure(0, "connection refused");
        let reporter = HealthReporter::new(Arc::clone(&registry));

        let json = serde_json::to_value(reporter.report()).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["backend"][0]["name"], "primary");
        assert_eq!(json["backend"][0]["state"], "SUSPECT");
        assert!(json["backend"][0]["lastContact"].is_null());
        assert_eq!(json["backend"][0]["lastError"], "connection refused");
        assert!(json["uptime"].is_u64());
    }

    #[test]
    fn test_report_has_no_side_effects() {
        let registry = Arc::new(BackendRegistry::from_config(&GatewayConfig::default()).unwrap());
        let reporter = HealthReporter::new(Arc::clone(&registry));
        let before = serde_json::to_value(&reporter.report().backend).unwrap();
        let _ = reporter.report();
        let after = serde_json::to_value(&reporter.report().backend).unwrap();
        assert_eq!(before, after);
    }
}
