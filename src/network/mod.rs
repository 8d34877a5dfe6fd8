//! Acknowledged wire protocol between a device/master pair.
//!
//! - [`protocol`]: the XML wire envelope and heartbeat frames.
//! - [`link`]: the per-connection actor that frames outgoing commands, guards
//!   them with ack timers and runs the heartbeat exchange.
//! - [`catalog`]: the message-name/schema binding used to validate inbound
//!   frames for the server role.

pub mod catalog;
pub mod link;
pub mod protocol;

pub use catalog::{MessageCatalog, MessageValidator, NoValidation};
pub use link::{LinkConfig, LinkEvent, LinkHandle, LinkRole, ProtocolLink};
pub use protocol::Envelope;
