use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    net::SocketAddr,
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, EnumIter, EnumString};

/// Fields available on every event, regardless of its payload.
const HEADER_FIELDS: &[&str] = &["header.pid", "header.ppid", "header.image"];

/// Open flags usable by name inside rule expressions.
const OPEN_FLAGS: &[(&str, i64)] = &[
    ("O_RDONLY", 0o0),
    ("O_WRONLY", 0o1),
    ("O_RDWR", 0o2),
    ("O_CREAT", 0o100),
    ("O_EXCL", 0o200),
    ("O_NOCTTY", 0o400),
    ("O_TRUNC", 0o1000),
    ("O_APPEND", 0o2000),
    ("O_NONBLOCK", 0o4000),
    ("O_DIRECTORY", 0o200000),
    ("O_CLOEXEC", 0o2000000),
];

/// Built-in constants handed to the rule evaluator.
pub fn constants() -> HashMap<String, i64> {
    OPEN_FLAGS
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

/// A single activity observed by a probe.
///
/// Events are immutable once built: the probe constructs them, the rule set
/// reads them, and they are dropped after evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub(crate) header: Header,
    pub(crate) payload: Payload,
}

impl Event {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn event_type(&self) -> EventType {
        EventType::from(&self.payload)
    }

    /// Resolve a dotted field path (`header.image`, `payload.filename`, ...)
    /// against this event.
    ///
    /// Returns `None` when the path doesn't exist for this kind of event.
    pub fn field(&self, path: &str) -> Option<FieldValue<'_>> {
        match path {
            "header.pid" => Some(FieldValue::Int(self.header.pid.into())),
            "header.ppid" => Some(FieldValue::Int(self.header.ppid.into())),
            "header.image" => Some(FieldValue::Str(Cow::Borrowed(&self.header.image))),
            _ => self.payload.field(path),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        let time = DateTime::<Utc>::from(header.timestamp).format("%Y-%m-%dT%TZ");
        let event_type = self.event_type();

        if f.alternate() {
            write!(
                f,
                "[{time} \x1b[1;30;46m{event_type}\x1b[0m {} ({})] {}",
                header.image, header.pid, self.payload
            )
        } else {
            write!(
                f,
                "[{time} {event_type} {} ({})] {}",
                header.image, header.pid, self.payload
            )
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub pid: i32,
    pub ppid: i32,
    pub image: String,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, EnumDiscriminants)]
#[serde(tag = "type", content = "content")]
#[strum_discriminants(derive(
    EnumString,
    EnumIter,
    strum::Display,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
))]
#[strum_discriminants(name(EventType))]
pub enum Payload {
    Exec {
        filename: String,
        argv: Vec<String>,
    },
    FileOpened {
        filename: String,
        flags: i32,
    },
    FileDeleted {
        filename: String,
    },
    Connect {
        destination: SocketAddr,
    },
    Exit {
        exit_code: u32,
    },
}

impl Payload {
    fn field(&self, path: &str) -> Option<FieldValue<'_>> {
        match (self, path) {
            (
                Payload::Exec { filename, .. }
                | Payload::FileOpened { filename, .. }
                | Payload::FileDeleted { filename },
                "payload.filename",
            ) => Some(FieldValue::Str(Cow::Borrowed(filename))),
            (Payload::Exec { argv, .. }, "payload.argv") => {
                Some(FieldValue::Str(Cow::Owned(argv.join(" "))))
            }
            (Payload::FileOpened { flags, .. }, "payload.flags") => {
                Some(FieldValue::Int((*flags).into()))
            }
            (Payload::Connect { destination }, "payload.destination") => Some(FieldValue::Str(
                Cow::Owned(destination.ip().to_string()),
            )),
            (Payload::Connect { destination }, "payload.port") => {
                Some(FieldValue::Int(destination.port().into()))
            }
            (Payload::Exit { exit_code }, "payload.exit_code") => {
                Some(FieldValue::Int((*exit_code).into()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Exec { filename, argv } => {
                write!(f, "Exec {{ filename: {filename}, argv: [{}] }}", argv.join(" "))
            }
            Payload::FileOpened { filename, flags } => {
                write!(f, "File Opened {{ filename: {filename}, flags: {flags:#o} }}")
            }
            Payload::FileDeleted { filename } => {
                write!(f, "File Deleted {{ filename: {filename} }}")
            }
            Payload::Connect { destination } => {
                write!(f, "Connect {{ destination: {destination} }}")
            }
            Payload::Exit { exit_code } => write!(f, "Exit {{ exit_code: {exit_code} }}"),
        }
    }
}

impl EventType {
    /// Payload field paths carried by this kind of event.
    pub fn payload_fields(&self) -> &'static [&'static str] {
        match self {
            EventType::Exec => &["payload.filename", "payload.argv"],
            EventType::FileOpened => &["payload.filename", "payload.flags"],
            EventType::FileDeleted => &["payload.filename"],
            EventType::Connect => &["payload.destination", "payload.port"],
            EventType::Exit => &["payload.exit_code"],
        }
    }

    /// Check if a field path can be resolved on events of this type.
    pub fn has_field(&self, path: &str) -> bool {
        HEADER_FIELDS.contains(&path) || self.payload_fields().contains(&path)
    }

    /// Kind of value stored at `path`, if the path exists for this type.
    pub fn field_kind(&self, path: &str) -> Option<FieldKind> {
        if !self.has_field(path) {
            return None;
        }
        match path {
            "header.pid" | "header.ppid" | "payload.flags" | "payload.port"
            | "payload.exit_code" => Some(FieldKind::Int),
            _ => Some(FieldKind::Str),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
}

/// Value read from an event field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Str(Cow<'a, str>),
    Int(i64),
}

impl FieldValue<'_> {
    pub fn into_owned(self) -> FieldValue<'static> {
        match self {
            FieldValue::Str(s) => FieldValue::Str(Cow::Owned(s.into_owned())),
            FieldValue::Int(i) => FieldValue::Int(i),
        }
    }
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{s}"),
            FieldValue::Int(i) => write!(f, "{i}"),
        }
    }
}
