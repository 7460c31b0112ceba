//! Liveness tracking for the long-running loops of pipeline processes.
//!
//! Serving HTTP is not proof of life for a worker or janitor: the loop that
//! does the actual work can wedge while axum keeps answering probes. Each
//! loop therefore registers itself with a deadline and pings its
//! [`HealthHandle`] on every iteration. The probe passes only while every
//! registered loop has pinged within its deadline.
//!
//! Keep liveness and readiness in separate registries: kubernetes reacts
//! differently to each, and merging them hides which one is failing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::warn;

/// Status of one registered component, as reported or derived at probe time.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, first report still pending.
    Starting,
    /// Healthy report received, trusted until the embedded instant.
    HealthyUntil(OffsetDateTime),
    /// The component reported a failure.
    Unhealthy,
    /// No report arrived before the deadline.
    Stalled,
}

impl ComponentStatus {
    /// Resolve the stored status into what a probe should see at `now`:
    /// an expired `HealthyUntil` reads as `Stalled`.
    fn at(&self, now: OffsetDateTime) -> ComponentStatus {
        match self {
            ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
            other => other.clone(),
        }
    }

    fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(_))
    }
}

type StatusCell = Arc<RwLock<ComponentStatus>>;

/// Snapshot returned by probes: overall verdict plus per-component detail.
#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise, with the component map in the body
    /// so a failing probe can be read straight off kubectl output.
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, format!("{self:?}")).into_response()
    }
}

/// Writer end for one component, owned by the loop it tracks.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    cell: StatusCell,
}

impl HealthHandle {
    /// Marks the component healthy for one more deadline window. Call once
    /// per loop iteration.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
        .await
    }

    /// Records an explicit status for the component.
    pub async fn report_status(&self, status: ComponentStatus) {
        match self.cell.write() {
            Ok(mut slot) => *slot = status,
            Err(_) => warn!("{} status cell poisoned, dropping report", self.component),
        }
    }
}

/// Shared registry of components, cheap to clone into axum routers.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, StatusCell>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a component under `name`. The returned handle must then
    /// report more often than `deadline` for the probe to keep passing.
    pub async fn register(&self, name: String, deadline: Duration) -> HealthHandle {
        let cell: StatusCell = Arc::new(RwLock::new(ComponentStatus::Starting));
        match self.components.write() {
            Ok(mut map) => {
                map.insert(name.clone(), cell.clone());
            }
            Err(_) => warn!("health registry lock poisoned, {name} will not be tracked"),
        }
        HealthHandle {
            component: name,
            deadline,
            cell,
        }
    }

    /// Aggregate status of the process, usable as an axum handler.
    ///
    /// Reports unhealthy until the first component registers: probes must
    /// not pass before the loops they are meant to guard exist.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();

        let Ok(map) = self.components.read() else {
            warn!("{} health registry lock poisoned", self.name);
            return HealthStatus::default();
        };
        let components: HashMap<String, ComponentStatus> = map
            .iter()
            .map(|(name, cell)| {
                let status = cell
                    .read()
                    .map_or(ComponentStatus::Unhealthy, |slot| slot.at(now));
                (name.clone(), status)
            })
            .collect();

        let healthy =
            !components.is_empty() && components.values().all(ComponentStatus::is_healthy);
        if !healthy {
            warn!("{} probe failing: {:?}", self.name, components);
        }
        HealthStatus {
            healthy,
            components,
        }
    }
}
