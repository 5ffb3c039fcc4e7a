//! Push based telemetry.
//!
//! Components publish their counters through a [`StatsSink`]. The daemon uses
//! a [`StatsdClient`], which writes DogStatsD lines over UDP; tests use an
//! in-memory sink.

use std::{fmt::Display, io, net::UdpSocket};

use thiserror::Error;

const DEFAULT_NAMESPACE: &str = "warden.";

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("cannot create statsd client for {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("sending metric {name}")]
    Send {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Receiver of metrics.
///
/// Implementations must never block the caller for long: stats are published
/// from a background task and are not on the critical path.
///
/// Counters are published as gauges of their running total, leaving rate
/// computation to the consumer.
pub trait StatsSink: Send + Sync {
    /// Publish an absolute value.
    fn gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<(), StatsError>;
}

/// Build a `key:value` tag.
pub fn tag(key: &str, value: impl Display) -> String {
    format!("{key}:{value}")
}

/// Statsd client writing on a connected, non-blocking UDP socket.
#[derive(Debug)]
pub struct StatsdClient {
    socket: UdpSocket,
    namespace: String,
}

impl StatsdClient {
    pub fn new(addr: &str) -> Result<Self, StatsError> {
        let connect = || -> io::Result<UdpSocket> {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.connect(addr)?;
            socket.set_nonblocking(true)?;
            Ok(socket)
        };

        let socket = connect().map_err(|source| StatsError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        log::debug!("sending stats to statsd at {addr}");

        Ok(Self {
            socket,
            namespace: DEFAULT_NAMESPACE.to_string(),
        })
    }

    fn send(&self, name: &str, value: impl Display, kind: &str, tags: &[String]) -> Result<(), StatsError> {
        let line = format_metric(&self.namespace, name, value, kind, tags);
        self.socket
            .send(line.as_bytes())
            .map(|_| ())
            .map_err(|source| StatsError::Send {
                name: name.to_string(),
                source,
            })
    }
}

impl StatsSink for StatsdClient {
    fn gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<(), StatsError> {
        self.send(name, value, "g", tags)
    }
}

fn format_metric(
    namespace: &str,
    name: &str,
    value: impl Display,
    kind: &str,
    tags: &[String],
) -> String {
    if tags.is_empty() {
        format!("{namespace}{name}:{value}|{kind}")
    } else {
        format!("{namespace}{name}:{value}|{kind}|#{}", tags.join(","))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemorySink, Metric};

#[cfg(any(test, feature = "test-utils"))]
mod memory {
    use std::sync::{Mutex, PoisonError};

    use super::{StatsError, StatsSink};

    #[derive(Debug, Clone, PartialEq)]
    pub struct Metric {
        pub name: String,
        pub value: f64,
        pub tags: Vec<String>,
    }

    /// Sink keeping every published metric in memory.
    #[derive(Debug, Default)]
    pub struct MemorySink {
        metrics: Mutex<Vec<Metric>>,
    }

    impl MemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn metrics(&self) -> Vec<Metric> {
            self.metrics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Last value published for `name`, optionally restricted to metrics
        /// carrying `tag`.
        pub fn last(&self, name: &str, tag: Option<&str>) -> Option<f64> {
            self.metrics()
                .into_iter()
                .rev()
                .find(|m| m.name == name && tag.is_none_or(|t| m.tags.iter().any(|x| x == t)))
                .map(|m| m.value)
        }

        fn push(&self, name: &str, value: f64, tags: &[String]) {
            self.metrics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Metric {
                    name: name.to_string(),
                    value,
                    tags: tags.to_vec(),
                });
        }
    }

    impl StatsSink for MemorySink {
        fn gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<(), StatsError> {
            self.push(name, value, tags);
            Ok(())
        }
    }
}
