//! Shared building blocks of the warden agent: the event model produced by
//! probes, section based configuration, telemetry sinks and the cooperative
//! shutdown signal used by background tasks.

pub mod config;
pub mod event;
pub mod shutdown;
pub mod stats;

pub use config::{ConfigError, ModuleConfig};
pub use event::{Event, EventType, FieldKind, FieldValue, Header, Payload};
pub use shutdown::{ShutdownSender, ShutdownSignal};
pub use stats::{StatsError, StatsSink, StatsdClient};
