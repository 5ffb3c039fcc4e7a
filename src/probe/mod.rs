//! Event sources.
//!
//! A [`Probe`] observes system activity and hands every [`Event`] to the
//! registered [`EventHandler`]. The rule set in force is pushed to the probe
//! so it can drop, close to the source, events no rule is interested in.

use std::{collections::BTreeMap, io, path::PathBuf, sync::Arc};

use rules_engine::RuleSet;
use serde::Serialize;
use thiserror::Error;
use warden_core::{Event, EventType, StatsError, StatsSink};

pub mod procfs;

pub use procfs::{ProcfsConfig, ProcfsProbe};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe not initialized")]
    NotInitialized,
    #[error("probe already started")]
    AlreadyStarted,
    #[error("reading {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("spawning probe thread")]
    Spawn(#[source] io::Error),
    #[error("discarder on '{field}' not supported")]
    UnsupportedDiscarder { field: String },
    #[error("field '{field}' missing from {event_type} event")]
    MissingField { field: String, event_type: EventType },
}

/// Receiver of the events observed by a probe.
///
/// Called from probe owned threads, possibly concurrently.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

pub trait Probe: Send + Sync {
    fn init(&self) -> Result<(), ProbeError>;

    fn start(&self) -> Result<(), ProbeError>;

    /// Record the current state of the system, so that activity which
    /// happened before the probe started isn't reported.
    fn snapshot(&self) -> Result<(), ProbeError>;

    fn set_event_handler(&self, handler: Arc<dyn EventHandler>);

    /// Field paths the probe can filter on.
    fn supported_discarders(&self) -> Vec<String>;

    /// Push the default filters implied by `rule_set`. Previously installed
    /// discarders are removed.
    fn apply_rule_set(&self, rule_set: &RuleSet) -> Result<Report, ProbeError>;

    /// Stop delivering events of `event_type` carrying the value `event` has
    /// in `field`.
    fn on_new_discarder(
        &self,
        rule_set: &RuleSet,
        event: &Event,
        field: &str,
        event_type: EventType,
    ) -> Result<(), ProbeError>;

    fn send_stats(&self, sink: &dyn StatsSink) -> Result<(), StatsError>;

    fn get_stats(&self) -> Result<BTreeMap<String, u64>, ProbeError>;

    /// Stop producing events and release the event handler.
    fn close(&self) -> Result<(), ProbeError>;
}

/// What the probe does with events of a given type.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Accept,
    Drop,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventTypePolicy {
    pub mode: PolicyMode,
    pub rules: usize,
}

/// Outcome of applying a rule set to a probe.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Report {
    pub rules: usize,
    pub policies: BTreeMap<String, EventTypePolicy>,
    pub supported_discarders: Vec<String>,
}
