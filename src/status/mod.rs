// src/status/mod.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::resolver::EngineState;
use crate::resolver::defaults::service_code;

/// Numeric node status, derived and never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// 0: everything operational
    Healthy,
    /// 1: waiting for setup
    Ephemeral,
    /// 2: a resolution is running
    Resolving,
    /// 10: a core component is failing
    CoreIssue,
    /// 499: nothing reported yet
    Unknown,
}

/// Severity shown alongside a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusColor {
    /// Nothing to do
    Ok,
    /// Working, but needs attention
    Degraded,
    /// Not working
    Critical,
}

impl StatusCode {
    /// Numeric form
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Healthy => 0,
            StatusCode::Ephemeral => 1,
            StatusCode::Resolving => 2,
            StatusCode::CoreIssue => 10,
            StatusCode::Unknown => 499,
        }
    }

    /// Operator-facing description
    pub fn description(&self) -> &'static str {
        match self {
            StatusCode::Healthy => "Everything is ok",
            StatusCode::Ephemeral => "Morio is running in ephemeral mode",
            StatusCode::Resolving => "Morio is resolving the configuration",
            StatusCode::CoreIssue => "There is an issue with the core service",
            StatusCode::Unknown => "Morio status is unknown because it was never set",
        }
    }

    /// Color for dashboards
    pub fn color(&self) -> StatusColor {
        match self {
            StatusCode::Healthy => StatusColor::Ok,
            StatusCode::Ephemeral | StatusCode::Resolving | StatusCode::Unknown => {
                StatusColor::Degraded
            }
            StatusCode::CoreIssue => StatusColor::Critical,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// Something that reports its health
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Config resolution engine
    Resolver,
    /// Config store backends
    Store,
    /// Certificate Authority
    Ca,
    /// Cluster coordination
    Cluster,
    /// A managed service, by name
    Service(String),
}

impl Component {
    /// Service code used to label failures of this component
    pub fn code(&self) -> u16 {
        match self {
            Component::Ca => 12,
            Component::Service(name) => service_code(name).unwrap_or(10),
            _ => 10,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Resolver => write!(f, "resolver"),
            Component::Store => write!(f, "store"),
            Component::Ca => write!(f, "ca"),
            Component::Cluster => write!(f, "cluster"),
            Component::Service(name) => write!(f, "service:{}", name),
        }
    }
}

/// Last reported condition of a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// Last report was fine
    Ok,
    /// Failing since `since`
    Failing { reason: String, since: DateTime<Utc> },
}

/// Everything the aggregator has observed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Resolution engine state; `None` until the engine first reports
    pub engine: Option<EngineState>,

    /// Condition per component
    pub components: BTreeMap<Component, Condition>,
}

impl StatusSnapshot {
    /// Components currently failing, with their reasons
    pub fn failures(&self) -> impl Iterator<Item = (&Component, &str)> {
        self.components.iter().filter_map(|(component, condition)| match condition {
            Condition::Failing { reason, .. } => Some((component, reason.as_str())),
            Condition::Ok => None,
        })
    }
}

/// Reduces a snapshot to a status code
pub fn current_status(snapshot: &StatusSnapshot) -> StatusCode {
    match snapshot.engine {
        None => StatusCode::Unknown,
        Some(EngineState::Ephemeral) => StatusCode::Ephemeral,
        Some(EngineState::Resolving) => StatusCode::Resolving,
        Some(EngineState::Degraded) => StatusCode::CoreIssue,
        Some(EngineState::Operational) => {
            if snapshot.failures().next().is_some() {
                StatusCode::CoreIssue
            } else {
                StatusCode::Healthy
            }
        }
    }
}

/// Shared status board: components report into it, readers derive the code
#[derive(Clone)]
pub struct StatusAggregator {
    board: Arc<watch::Sender<StatusSnapshot>>,
}

impl StatusAggregator {
    /// Creates an empty board
    pub fn new() -> Self {
        let (board, _) = watch::channel(StatusSnapshot::default());
        Self {
            board: Arc::new(board),
        }
    }

    /// Handle components report through
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter {
            board: self.board.clone(),
        }
    }

    /// Current status code
    pub fn current_status(&self) -> StatusCode {
        current_status(&self.board.borrow())
    }

    /// Copy of everything observed so far
    pub fn snapshot(&self) -> StatusSnapshot {
        self.board.borrow().clone()
    }

    /// Receives every change to the snapshot
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.board.subscribe()
    }
}

impl Default for StatusAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap, cloneable handle used by components to report their health
#[derive(Clone)]
pub struct StatusReporter {
    board: Arc<watch::Sender<StatusSnapshot>>,
}

impl StatusReporter {
    /// Records the resolution engine state
    pub fn engine(&self, state: EngineState) {
        self.update(|snapshot| {
            if snapshot.engine == Some(state) {
                return false;
            }
            snapshot.engine = Some(state);
            true
        });
    }

    /// Records a component as healthy
    pub fn ok(&self, component: Component) {
        self.update(|snapshot| {
            let changed = snapshot.components.get(&component) != Some(&Condition::Ok);
            if changed {
                debug!("{} reports ok", component);
                snapshot.components.insert(component, Condition::Ok);
            }
            changed
        });
    }

    /// Records a component as failing; the first failure time is kept
    pub fn failing(&self, component: Component, reason: impl Into<String>) {
        let reason = reason.into();
        self.update(|snapshot| {
            let since = match snapshot.components.get(&component) {
                Some(Condition::Failing { reason: known, .. }) if *known == reason => return false,
                Some(Condition::Failing { since, .. }) => *since,
                _ => Utc::now(),
            };
            warn!(code = component.code(), "{} is failing: {}", component, reason);
            snapshot
                .components
                .insert(component, Condition::Failing { reason, since });
            true
        });
    }

    /// Forgets a component, for services that are no longer managed
    pub fn remove(&self, component: &Component) {
        self.update(|snapshot| snapshot.components.remove(component).is_some());
    }

    fn update(&self, modify: impl FnOnce(&mut StatusSnapshot) -> bool) {
        let changed = self.board.send_if_modified(modify);
        if changed {
            let code = current_status(&self.board.borrow());
            metrics::gauge!("morio_status_code", f64::from(code.code()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_descriptions_and_colors() {
        assert_eq!(StatusCode::Unknown.code(), 499);
        assert_eq!(StatusCode::Ephemeral.description(), "Morio is running in ephemeral mode");
        assert_eq!(StatusCode::Healthy.color(), StatusColor::Ok);
        assert_eq!(StatusCode::Resolving.color(), StatusColor::Degraded);
        assert_eq!(StatusCode::CoreIssue.color(), StatusColor::Critical);
    }

    #[test]
    fn never_initialized_is_unknown() {
        let aggregator = StatusAggregator::new();
        assert_eq!(aggregator.current_status(), StatusCode::Unknown);
    }

    #[test]
    fn engine_states_map_to_codes() {
        let aggregator = StatusAggregator::new();
        let reporter = aggregator.reporter();

        reporter.engine(EngineState::Ephemeral);
        assert_eq!(aggregator.current_status().code(), 1);
        reporter.engine(EngineState::Resolving);
        assert_eq!(aggregator.current_status().code(), 2);
        reporter.engine(EngineState::Operational);
        assert_eq!(aggregator.current_status().code(), 0);
        reporter.engine(EngineState::Degraded);
        assert_eq!(aggregator.current_status().code(), 10);
    }

    #[test]
    fn a_failing_component_is_a_core_issue_until_it_recovers() {
        let aggregator = StatusAggregator::new();
        let reporter = aggregator.reporter();
        reporter.engine(EngineState::Operational);

        reporter.failing(Component::Service("broker".to_string()), "start timed out");
        assert_eq!(aggregator.current_status(), StatusCode::CoreIssue);
        let snapshot = aggregator.snapshot();
        let (component, reason) = snapshot.failures().next().unwrap();
        assert_eq!(component.code(), 13);
        assert_eq!(reason, "start timed out");

        reporter.ok(Component::Service("broker".to_string()));
        assert_eq!(aggregator.current_status(), StatusCode::Healthy);
    }

    #[test]
    fn repeated_failures_keep_the_first_timestamp() {
        let aggregator = StatusAggregator::new();
        let reporter = aggregator.reporter();
        reporter.failing(Component::Cluster, "leader unreachable");
        let first = aggregator.snapshot().components[&Component::Cluster].clone();
        reporter.failing(Component::Cluster, "leader still unreachable");

        match (first, aggregator.snapshot().components[&Component::Cluster].clone()) {
            (Condition::Failing { since: a, .. }, Condition::Failing { since: b, reason }) => {
                assert_eq!(a, b);
                assert_eq!(reason, "leader still unreachable");
            }
            other => panic!("unexpected conditions {:?}", other),
        }
    }

    #[test]
    fn status_is_safe_to_read_concurrently() {
        let aggregator = StatusAggregator::new();
        let reporter = aggregator.reporter();
        reporter.engine(EngineState::Operational);

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let aggregator = aggregator.clone();
                std::thread::spawn(move || aggregator.current_status())
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), StatusCode::Healthy);
        }
    }
}
