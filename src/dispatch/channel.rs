//! The command/acknowledge dispatch channel.
//!
//! A [`DispatchChannel`] pairs exactly two logical endpoints for the life of
//! the process: a requester (the controller that wants work done) and an
//! executor (the controller that does it). Commands are delivered to the
//! executor in send order; each command carries a fresh [`Ref`] and the
//! executor answers through a [`ReplyHandle`] that is consumed by the reply,
//! so at most one acknowledge can ever exist per reference.
//!
//! Back-pressure and unbound endpoints surface as [`DispatchError`] values.
//! Nothing on this path is silently dropped: an acknowledge arriving for a
//! reference that is not outstanding is logged and discarded, and the
//! requester is told via the error type when it asks for it synchronously.

use crate::messages::{Acknowledge, AckStatus, Command, Payload, Ref, RefSource};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Faults on the dispatch path. Always surfaced, never swallowed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The paired endpoint is gone (never bound, or its task ended).
    #[error("dispatch channel has no bound peer endpoint")]
    ChannelNotBound,
    /// The peer's mailbox is full; the caller must back off or fail the
    /// operation, the channel will not buffer unboundedly.
    #[error("dispatch mailbox full")]
    MailboxFull,
    /// An acknowledge arrived for a reference with no outstanding command.
    #[error("acknowledge for unknown reference {0}")]
    UnknownReference(Ref),
}

impl From<DispatchError> for crate::error::MasterError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::ChannelNotBound => crate::error::MasterError::ChannelNotBound,
            DispatchError::MailboxFull => crate::error::MasterError::MailboxFull,
            DispatchError::UnknownReference(r) => crate::error::MasterError::UnknownReference(r),
        }
    }
}

/// Factory for the paired endpoints.
pub struct DispatchChannel;

impl DispatchChannel {
    /// Create a bounded channel pair. `capacity` bounds both directions
    /// independently.
    pub fn bounded(capacity: usize) -> (RequesterEnd, ExecutorEnd) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (ack_tx, ack_rx) = mpsc::channel(capacity);
        (
            RequesterEnd {
                cmd_tx,
                ack_rx,
                refs: RefSource::new(),
                outstanding: std::collections::HashSet::new(),
            },
            ExecutorEnd { cmd_rx, ack_tx },
        )
    }
}

/// The sending side: builds correlated commands and receives acknowledges.
pub struct RequesterEnd {
    cmd_tx: mpsc::Sender<(Ref, Command)>,
    ack_rx: mpsc::Receiver<Acknowledge>,
    refs: RefSource,
    outstanding: std::collections::HashSet<Ref>,
}

impl RequesterEnd {
    /// Assign a reference and deliver the command FIFO to the executor.
    ///
    /// Fails with [`DispatchError::ChannelNotBound`] when the executor end is
    /// gone and [`DispatchError::MailboxFull`] when the executor is not
    /// keeping up; in both cases the command is not in flight afterwards.
    pub fn send(&mut self, command: Command) -> Result<Ref, DispatchError> {
        let reference = self.refs.next_ref();
        match self.cmd_tx.try_send((reference, command)) {
            Ok(()) => {
                self.outstanding.insert(reference);
                Ok(reference)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(DispatchError::MailboxFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::ChannelNotBound),
        }
    }

    /// Receive the next acknowledge, in executor send order.
    ///
    /// Acknowledges for references that are not outstanding are reported and
    /// skipped. Returns `None` when the executor end is gone and no
    /// acknowledges remain.
    pub async fn next_ack(&mut self) -> Option<Acknowledge> {
        loop {
            let ack = self.ack_rx.recv().await?;
            if self.outstanding.remove(&ack.reference) {
                return Some(ack);
            }
            warn!(
                reference = %ack.reference,
                "dropping acknowledge for unknown reference"
            );
        }
    }

    /// Number of commands sent but not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

/// The receiving side: consumes commands and replies through the handle.
pub struct ExecutorEnd {
    cmd_rx: mpsc::Receiver<(Ref, Command)>,
    ack_tx: mpsc::Sender<Acknowledge>,
}

impl ExecutorEnd {
    /// Receive the next command, in requester send order, together with the
    /// one-shot handle for its reply. Returns `None` when the requester end
    /// is gone and the mailbox is drained.
    pub async fn next_command(&mut self) -> Option<(Ref, Command, ReplyHandle)> {
        let (reference, command) = self.cmd_rx.recv().await?;
        let handle = ReplyHandle {
            reference,
            ack_tx: self.ack_tx.clone(),
        };
        Some((reference, command, handle))
    }
}

/// Write-once reply path for a single command.
///
/// The handle is consumed by [`reply`](Self::reply), which is what makes
/// "at most one acknowledge per reference" a compile-time guarantee rather
/// than a runtime check.
pub struct ReplyHandle {
    reference: Ref,
    ack_tx: mpsc::Sender<Acknowledge>,
}

impl ReplyHandle {
    /// The reference this handle answers.
    pub fn reference(&self) -> Ref {
        self.reference
    }

    /// Deliver the acknowledge back through the same channel the command
    /// arrived on. Fails with [`DispatchError::ChannelNotBound`] when the
    /// requester end is gone.
    pub async fn reply(
        self,
        status: AckStatus,
        payload: Payload,
    ) -> Result<(), DispatchError> {
        let ack = Acknowledge::new(self.reference, status).with_payload(payload);
        self.ack_tx
            .send(ack)
            .await
            .map_err(|_| DispatchError::ChannelNotBound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn commands_arrive_in_send_order() {
        let (mut requester, mut executor) = DispatchChannel::bounded(8);
        let first = requester.send(Command::new("CmdOvenOn")).unwrap();
        let second = requester.send(Command::new("CmdWaterOn")).unwrap();

        let (r1, c1, _) = executor.next_command().await.unwrap();
        let (r2, c2, _) = executor.next_command().await.unwrap();
        assert_eq!((r1, c1.name.as_str()), (first, "CmdOvenOn"));
        assert_eq!((r2, c2.name.as_str()), (second, "CmdWaterOn"));
    }

    #[tokio::test]
    async fn reply_correlates_by_reference() {
        let (mut requester, mut executor) = DispatchChannel::bounded(8);
        let reference = requester
            .send(Command::new("CmdGrapplerPark").with_payload(json!({"arm": "left"})))
            .unwrap();

        let (_, _, handle) = executor.next_command().await.unwrap();
        handle
            .reply(AckStatus::Ok, json!({"position": "park"}))
            .await
            .unwrap();

        let ack = requester.next_ack().await.unwrap();
        assert_eq!(ack.reference, reference);
        assert!(ack.status.is_ok());
        assert_eq!(requester.outstanding(), 0);
    }

    #[tokio::test]
    async fn send_fails_when_executor_gone() {
        let (mut requester, executor) = DispatchChannel::bounded(8);
        drop(executor);
        assert_eq!(
            requester.send(Command::new("CmdAgitationOn")),
            Err(DispatchError::ChannelNotBound)
        );
    }

    #[tokio::test]
    async fn reply_fails_when_requester_gone() {
        let (mut requester, mut executor) = DispatchChannel::bounded(8);
        requester.send(Command::new("CmdLoaderOpen")).unwrap();
        let (_, _, handle) = executor.next_command().await.unwrap();
        drop(requester);
        assert_eq!(
            handle.reply(AckStatus::Ok, json!({})).await,
            Err(DispatchError::ChannelNotBound)
        );
    }

    #[tokio::test]
    async fn full_mailbox_is_an_error_not_a_drop() {
        let (mut requester, _executor) = DispatchChannel::bounded(1);
        requester.send(Command::new("CmdOvenOn")).unwrap();
        assert_eq!(
            requester.send(Command::new("CmdOvenOff")),
            Err(DispatchError::MailboxFull)
        );
    }
}
