use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

/// Liveness reporting for the long-running loops of the pipeline.
///
/// Every consumer loop and the shared producer register a component and
/// must keep reporting healthy more often than their deadline. The process
/// is live only when:
///   - at least one component is registered,
///   - no component reported itself unhealthy,
///   - every component reported healthy within its deadline.
///
/// A component that misses its deadline shows up as `Stalled`. Use one
/// registry per probe; liveness and readiness are not mixed here.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when every registered component is healthy
    pub healthy: bool,
    /// Per-component status, rendered in the probe body for debugging
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, nothing reported yet
    Starting,
    /// Reported healthy, must report again before this instant
    HealthyUntil(Instant),
    /// Reported unhealthy
    Unhealthy,
    /// Missed its HealthyUntil deadline
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more frequently than the registered deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            Instant::now() + self.deadline,
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Poisoned lock: the probe will fail and the process restart
            Err(_) => warn!(component = %self.component, "poisoned health registry lock"),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component. The returned handle goes to the loop that
    /// must report its liveness.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Removes a component, used when a pipeline is shut down on purpose.
    pub fn deregister(&self, component: &str) {
        if let Ok(mut map) = self.components.write() {
            map.remove(component);
        }
    }

    /// Overall process status. Can be used directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("{} health check failed: poisoned registry lock", self.name);
                return HealthStatus::default();
            }
        };

        let now = Instant::now();
        let mut result = HealthStatus {
            // unhealthy until something registers
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => *status,
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => *other,
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_starting_component_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        let _handle = registry.register("consumer".to_string(), Duration::from_secs(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consumer"),
            Some(&ComponentStatus::Starting)
        );
    }

    #[test]
    fn test_all_components_healthy() {
        let registry = HealthRegistry::new("liveness");
        let one = registry.register("one".to_string(), Duration::from_secs(30));
        let two = registry.register("two".to_string(), Duration::from_secs(30));

        one.report_healthy();
        assert!(!registry.get_status().healthy);

        two.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn test_missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("consumer".to_string(), Duration::from_millis(0));
        handle.report_healthy();

        std::thread::sleep(Duration::from_millis(5));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("consumer"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn test_unhealthy_report_and_deregister() {
        let registry = HealthRegistry::new("liveness");
        let ok = registry.register("ok".to_string(), Duration::from_secs(30));
        let bad = registry.register("bad".to_string(), Duration::from_secs(30));
        ok.report_healthy();
        bad.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);

        registry.deregister(bad.component());
        assert!(registry.get_status().healthy);
    }
}
