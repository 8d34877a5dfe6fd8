//! Custom error types for the Master process.
//!
//! This module defines the primary error type, `MasterError`, used across the
//! supervisory kernel. Using the `thiserror` crate, it provides a centralized
//! taxonomy for the faults the kernel distinguishes:
//!
//! - **Channel errors** (`ChannelNotBound`, `MailboxFull`, `UnknownReference`,
//!   `DuplicateReference`): dispatch-channel faults. These are always surfaced
//!   to the caller, never silently dropped.
//! - **Protocol errors** (`Envelope`, `Protocol`, `ValidationFailed`,
//!   `HeartbeatMismatch`): a bad frame is rejected but the connection stays
//!   up; only a heartbeat ack-timeout is fatal to a connection.
//! - **Supervisory faults** (`DeviceStartFailed`, `TooManyRestarts`): drive
//!   the process supervisor's state machine toward `CommunicationRetry` or
//!   `FatalError`.
//! - **Timeouts** (`AckTimeout`): expected, recoverable events that must end
//!   in deterministic cleanup before any retry decision.
//!
//! By using `#[from]`, `MasterError` can be created from underlying error
//! types with the `?` operator.

use crate::messages::Ref;
use thiserror::Error;

/// Convenience alias for results using the kernel error type.
pub type MasterResult<T> = std::result::Result<T, MasterError>;

/// Errors raised by the supervisory/protocol kernel.
#[derive(Error, Debug)]
pub enum MasterError {
    #[error("Dispatch channel has no bound consumer")]
    ChannelNotBound,

    #[error("Dispatch mailbox is full")]
    MailboxFull,

    #[error("Acknowledge for unknown reference {0}")]
    UnknownReference(Ref),

    #[error("Reference {0} already has an outstanding command")]
    DuplicateReference(Ref),

    #[error("Malformed wire envelope: {0}")]
    Envelope(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Schema validation failed for message '{0}'")]
    ValidationFailed(String),

    #[error("Heartbeat sequence mismatch: sent {sent}, peer returned {got}")]
    HeartbeatMismatch { sent: u16, got: u16 },

    #[error("Managed device failed to start: {0}")]
    DeviceStartFailed(String),

    #[error("Process '{0}' exceeded its disconnect-guard threshold")]
    TooManyRestarts(String),

    #[error("Command '{name}' (ref {reference}) timed out waiting for acknowledge")]
    AckTimeout { reference: Ref, name: String },

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for MasterError {
    fn from(value: figment::Error) -> Self {
        MasterError::Config(Box::new(value))
    }
}

impl MasterError {
    /// Whether the fault is local and recoverable (a single rejected frame or
    /// missed acknowledge) as opposed to one that must change supervisor state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MasterError::Envelope(_)
                | MasterError::Protocol(_)
                | MasterError::ValidationFailed(_)
                | MasterError::HeartbeatMismatch { .. }
                | MasterError::UnknownReference(_)
                | MasterError::AckTimeout { .. }
                | MasterError::MailboxFull
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_faults_are_recoverable() {
        assert!(MasterError::Protocol("name mismatch".into()).is_recoverable());
        assert!(MasterError::HeartbeatMismatch { sent: 7, got: 9 }.is_recoverable());
        assert!(MasterError::AckTimeout {
            reference: Ref::new(3),
            name: "CmdStartStaining".into()
        }
        .is_recoverable());
    }

    #[test]
    fn supervisory_faults_are_not() {
        assert!(!MasterError::DeviceStartFailed("spawn failed".into()).is_recoverable());
        assert!(!MasterError::TooManyRestarts("gui".into()).is_recoverable());
        assert!(!MasterError::ChannelNotBound.is_recoverable());
    }
}
