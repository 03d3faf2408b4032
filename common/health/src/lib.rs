use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Liveness tracking for the long-running loops of a service.
///
/// Each loop registers itself with a deadline and reports in every tick. The
/// process is considered healthy only while every registered loop has
/// reported within its deadline, which is what the k8s liveness probe reads.
/// A loop that stops ticking (deadlock, panic swallowed by a join handle)
/// flips the probe without any extra plumbing.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentState>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ComponentState {
    /// Registered but has not reported yet.
    Starting,
    /// Healthy as long as the deadline has not passed.
    ReportedAt(DateTime<Utc>, chrono::Duration),
    /// The component itself said it is broken.
    Unhealthy,
}

impl ComponentState {
    fn describe(&self, now: DateTime<Utc>) -> &'static str {
        match self {
            ComponentState::Starting => "starting",
            ComponentState::ReportedAt(at, deadline) if now - *at <= *deadline => "healthy",
            ComponentState::ReportedAt(..) => "stalled",
            ComponentState::Unhealthy => "unhealthy",
        }
    }

    fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        matches!(self, ComponentState::ReportedAt(at, deadline) if now - *at <= *deadline)
    }
}

/// Handle given to a component so it can report in. Cheap to clone into the
/// component's task.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: chrono::Duration,
    components: Arc<RwLock<HashMap<String, ComponentState>>>,
}

impl HealthHandle {
    /// Must be called more often than the registered deadline.
    pub fn report_healthy(&self) {
        self.set(ComponentState::ReportedAt(Utc::now(), self.deadline));
    }

    pub fn report_unhealthy(&self) {
        self.set(ComponentState::Unhealthy);
    }

    fn set(&self, state: ComponentState) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), state);
            }
            // A poisoned lock means some reporter panicked; the probe will
            // flip to unhealthy on its own once deadlines lapse.
            Err(_) => warn!("health registry lock poisoned"),
        }
    }
}

/// Snapshot of the registry, rendered on the liveness route.
#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, &'static str>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a component. The returned handle should be moved into the
    /// component's task so it can report every tick.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let deadline = chrono::Duration::from_std(deadline)
            .expect("component deadline out of range");
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.set(ComponentState::Starting);
        handle
    }

    /// Overall process status: healthy only if at least one component is
    /// registered and all of them reported within their deadline.
    pub fn status(&self) -> HealthStatus {
        let now = Utc::now();
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("{} health registry lock poisoned", self.name);
                return HealthStatus::default();
            }
        };

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::new(),
        };
        for (name, state) in components.iter() {
            if !state.is_healthy(now) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), state.describe(now));
        }
        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
