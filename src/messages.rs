//! Correlated message types for command/acknowledge exchanges.
//!
//! Every request in the Master flows as a [`Command`] tagged with a [`Ref`],
//! and is answered by exactly one [`Acknowledge`] carrying the same `Ref`.
//! References are generated by a [`RefSource`] and are unique for the life of
//! the process, so a reply can always be matched to the request that caused
//! it, across threads and across the wire.
//!
//! Payloads are untyped JSON maps keyed by the command name. The dispatch and
//! protocol layers only need "has a name, a timeout, and is (de)serializable";
//! the per-device command catalogs live with their controllers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Process-wide unique correlation id linking a command to its acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref(u64);

impl Ref {
    /// Build a reference from a raw value (used when accepting a reference
    /// assigned by a peer).
    pub fn new(value: u64) -> Self {
        Ref(value)
    }

    /// The raw wire value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic generator for [`Ref`] values.
///
/// References start at 1 and never repeat; 0 is reserved as "no reference"
/// on the wire.
#[derive(Debug)]
pub struct RefSource {
    next: AtomicU64,
}

impl RefSource {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Hand out the next unique reference.
    pub fn next_ref(&self) -> Ref {
        Ref(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RefSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Command payload: a flat map of data items, serialized onto the wire as
/// attributes of the `<dataitems>` element.
pub type Payload = serde_json::Value;

/// A request flowing through a dispatch channel or out on a protocol link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Message name, e.g. `CmdStartStaining`.
    pub name: String,
    /// How long the sender is willing to wait for the acknowledge.
    /// `None` means the requester enforces no timeout of its own.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_millis")]
    pub timeout: Option<Duration>,
    /// Command-specific data items.
    #[serde(default = "empty_payload")]
    pub payload: Payload,
}

fn empty_payload() -> Payload {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            payload: empty_payload(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// Outcome of an acknowledged exchange, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    /// The peer accepted and executed the command.
    Ok,
    /// The peer refused the command.
    Nack,
    /// The exchange failed with a peer-supplied reason.
    Failed(String),
}

impl AckStatus {
    /// Wire representation (`status` attribute of the acknowledge frame).
    pub fn as_wire(&self) -> &str {
        match self {
            AckStatus::Ok => "OK",
            AckStatus::Nack => "NACK",
            AckStatus::Failed(reason) => reason.as_str(),
        }
    }

    /// Parse the `status` attribute of an inbound acknowledge frame.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "OK" => AckStatus::Ok,
            "NACK" => AckStatus::Nack,
            other => AckStatus::Failed(other.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, AckStatus::Ok)
    }
}

/// The single reply matched to one outstanding [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledge {
    /// Reference of the command being acknowledged.
    pub reference: Ref,
    /// Exchange outcome.
    pub status: AckStatus,
    /// Reply data items.
    pub payload: Payload,
}

impl Acknowledge {
    pub fn new(reference: Ref, status: AckStatus) -> Self {
        Self {
            reference,
            status,
            payload: empty_payload(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms: Option<u64> = Option::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_monotonic_and_unique() {
        let source = RefSource::new();
        let a = source.next_ref();
        let b = source.next_ref();
        let c = source.next_ref();
        assert!(a < b && b < c);
        assert_eq!(a.value(), 1);
    }

    #[test]
    fn ack_status_wire_strings() {
        assert_eq!(AckStatus::Ok.as_wire(), "OK");
        assert_eq!(AckStatus::Nack.as_wire(), "NACK");
        assert_eq!(AckStatus::from_wire("OK"), AckStatus::Ok);
        assert_eq!(AckStatus::from_wire("NACK"), AckStatus::Nack);
        assert_eq!(
            AckStatus::from_wire("oven overtemp"),
            AckStatus::Failed("oven overtemp".into())
        );
    }

    #[test]
    fn command_timeout_roundtrips_as_millis() {
        let cmd = Command::new("CmdHeartbeat").with_timeout(Duration::from_millis(3000));
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeout, Some(Duration::from_millis(3000)));
    }
}
