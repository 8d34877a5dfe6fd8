//! The XML wire envelope.
//!
//! Every frame on a device/master connection is one envelope:
//!
//! ```text
//! <message><cmd name="NAME" ref="REF"/><dataitems a="1" b="2"/></message>
//! ```
//!
//! Acknowledge frames use the reserved name `Acknowledge` and carry the
//! acknowledged command's name (`cmd`) and the outcome (`status`, `OK` |
//! `NACK` | failure text) as data items. Heartbeat frames are ordinary
//! commands named `HeartBeatServer`/`HeartBeatClient` with a single decimal
//! `nr` item (u16, wrapping).
//!
//! The tag and attribute names are kept exactly as the legacy peers expect
//! them. Frames are exchanged one per newline-terminated line.

use crate::error::{MasterError, MasterResult};
use crate::messages::{AckStatus, Command, Ref};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeMap;

/// Reserved envelope name for acknowledge frames.
pub const ACKNOWLEDGE: &str = "Acknowledge";
/// Heartbeat probe sent by the initiator.
pub const HEARTBEAT_SERVER: &str = "HeartBeatServer";
/// Heartbeat reply sent by the responder.
pub const HEARTBEAT_CLIENT: &str = "HeartBeatClient";

const TAG_MESSAGE: &[u8] = b"message";
const TAG_CMD: &[u8] = b"cmd";
const TAG_DATAITEMS: &[u8] = b"dataitems";

/// One wire frame: command name, reference, and flat data items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message name (`cmd name` attribute).
    pub name: String,
    /// Correlation reference (`cmd ref` attribute).
    pub reference: Ref,
    /// `dataitems` attributes, sorted for a stable wire form.
    pub items: BTreeMap<String, String>,
}

impl Envelope {
    pub fn new(name: impl Into<String>, reference: Ref) -> Self {
        Self {
            name: name.into(),
            reference,
            items: BTreeMap::new(),
        }
    }

    pub fn with_item(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.items.insert(key.into(), value.into());
        self
    }

    /// Frame an outgoing [`Command`] under the given reference.
    ///
    /// Payload items must be scalars (they become attributes).
    pub fn command(command: &Command, reference: Ref) -> MasterResult<Self> {
        let mut envelope = Envelope::new(command.name.clone(), reference);
        if let Some(object) = command.payload.as_object() {
            for (key, value) in object {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(MasterError::Envelope(format!(
                            "data item '{key}' of '{}' is not a scalar: {other}",
                            command.name
                        )))
                    }
                };
                envelope.items.insert(key.clone(), text);
            }
        } else if !command.payload.is_null() {
            return Err(MasterError::Envelope(format!(
                "payload of '{}' is not an object",
                command.name
            )));
        }
        Ok(envelope)
    }

    /// Frame an acknowledge for the command `cmd_name` under `reference`.
    pub fn acknowledge(reference: Ref, cmd_name: &str, status: &AckStatus) -> Self {
        Envelope::new(ACKNOWLEDGE, reference)
            .with_item("cmd", cmd_name)
            .with_item("status", status.as_wire())
    }

    /// Frame a heartbeat probe.
    pub fn heartbeat_server(nr: u16, reference: Ref) -> Self {
        Envelope::new(HEARTBEAT_SERVER, reference).with_item("nr", nr.to_string())
    }

    /// Frame a heartbeat reply.
    pub fn heartbeat_client(nr: u16, reference: Ref) -> Self {
        Envelope::new(HEARTBEAT_CLIENT, reference).with_item("nr", nr.to_string())
    }

    /// True for acknowledge frames.
    pub fn is_acknowledge(&self) -> bool {
        self.name == ACKNOWLEDGE
    }

    /// Acknowledged command name, for acknowledge frames.
    pub fn ack_cmd_name(&self) -> Option<&str> {
        self.items.get("cmd").map(String::as_str)
    }

    /// Exchange outcome, for acknowledge frames.
    pub fn ack_status(&self) -> Option<AckStatus> {
        self.items.get("status").map(|s| AckStatus::from_wire(s))
    }

    /// Heartbeat sequence number, for heartbeat frames.
    pub fn heartbeat_nr(&self) -> Option<u16> {
        self.items.get("nr")?.parse().ok()
    }

    /// The sequence number a well-behaved peer echoes for `sent`.
    pub fn expected_heartbeat_reply(sent: u16) -> u16 {
        sent.wrapping_add(1)
    }

    /// Serialize to the wire form (without trailing newline).
    pub fn to_xml(&self) -> MasterResult<String> {
        let mut writer = Writer::new(Vec::new());

        writer
            .write_event(Event::Start(BytesStart::new("message")))
            .map_err(|e| MasterError::Envelope(e.to_string()))?;

        let reference = self.reference.to_string();
        let mut cmd = BytesStart::new("cmd");
        cmd.push_attribute(("name", self.name.as_str()));
        cmd.push_attribute(("ref", reference.as_str()));
        writer
            .write_event(Event::Empty(cmd))
            .map_err(|e| MasterError::Envelope(e.to_string()))?;

        let mut data = BytesStart::new("dataitems");
        for (key, value) in &self.items {
            data.push_attribute((key.as_str(), value.as_str()));
        }
        writer
            .write_event(Event::Empty(data))
            .map_err(|e| MasterError::Envelope(e.to_string()))?;

        writer
            .write_event(Event::End(BytesEnd::new("message")))
            .map_err(|e| MasterError::Envelope(e.to_string()))?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| MasterError::Envelope(format!("frame is not UTF-8: {e}")))
    }

    /// Parse one wire frame. Any structural problem is an
    /// [`MasterError::Envelope`]; the caller rejects the frame and keeps the
    /// connection.
    pub fn from_xml(xml: &str) -> MasterResult<Self> {
        let mut reader = Reader::from_str(xml);
        let mut name: Option<String> = None;
        let mut reference: Option<Ref> = None;
        let mut items = BTreeMap::new();
        let mut saw_message = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                    TAG_MESSAGE => saw_message = true,
                    TAG_CMD => {
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| {
                                MasterError::Envelope(format!("bad cmd attribute: {e}"))
                            })?;
                            let value = attr.unescape_value().map_err(|e| {
                                MasterError::Envelope(format!("bad cmd attribute value: {e}"))
                            })?;
                            match attr.key.as_ref() {
                                b"name" => name = Some(value.into_owned()),
                                b"ref" => {
                                    let raw: u64 = value.parse().map_err(|_| {
                                        MasterError::Envelope(format!(
                                            "ref is not a number: '{value}'"
                                        ))
                                    })?;
                                    reference = Some(Ref::new(raw));
                                }
                                _ => {}
                            }
                        }
                    }
                    TAG_DATAITEMS => {
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| {
                                MasterError::Envelope(format!("bad data item: {e}"))
                            })?;
                            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                            let value = attr.unescape_value().map_err(|e| {
                                MasterError::Envelope(format!("bad data item value: {e}"))
                            })?;
                            items.insert(key, value.into_owned());
                        }
                    }
                    other => {
                        return Err(MasterError::Envelope(format!(
                            "unexpected element <{}>",
                            String::from_utf8_lossy(other)
                        )))
                    }
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(MasterError::Envelope(format!("malformed frame: {e}"))),
            }
        }

        if !saw_message {
            return Err(MasterError::Envelope("missing <message> root".to_string()));
        }
        let name = name.ok_or_else(|| MasterError::Envelope("missing cmd name".to_string()))?;
        let reference =
            reference.ok_or_else(|| MasterError::Envelope("missing cmd ref".to_string()))?;

        Ok(Envelope {
            name,
            reference,
            items,
        })
    }
}
