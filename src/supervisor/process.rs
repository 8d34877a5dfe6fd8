//! Managed child process lifecycle.
//!
//! A [`ManagedProcess`] spawns the device's executable and parks a monitor
//! task on it. Whether the process exits on its own or is killed by the
//! supervisor, the monitor reports a single `ProcessDisconnected` event back
//! into the supervision mailbox so the state machine sees process death and
//! connection loss through the same path.

use crate::config::ProcessDefinition;
use crate::error::{MasterError, MasterResult};
use crate::supervisor::states::SupervisorEvent;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Handle to a spawned device process.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    kill: Option<oneshot::Sender<()>>,
}

impl ManagedProcess {
    /// Spawn the process described by `definition`.
    ///
    /// The start command is split on whitespace: first token is the program,
    /// the rest are arguments. The monitor task owns the child and sends
    /// [`SupervisorEvent::ProcessDisconnected`] on `exits` once the process
    /// is gone, for whatever reason.
    pub fn spawn(
        definition: &ProcessDefinition,
        exits: mpsc::Sender<SupervisorEvent>,
    ) -> MasterResult<Self> {
        let mut parts = definition.start_command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            MasterError::DeviceStartFailed(format!(
                "process '{}' has an empty start command",
                definition.name
            ))
        })?;

        let mut command = Command::new(program);
        command.args(parts).kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| {
            MasterError::DeviceStartFailed(format!(
                "'{}' ({}): {e}",
                definition.name, definition.start_command
            ))
        })?;

        info!(
            process = %definition.name,
            command = %definition.start_command,
            pid = child.id(),
            "managed process started"
        );

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let name = definition.name.clone();
        let monitor_name = name.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => {
                        info!(process = %monitor_name, %status, "managed process exited")
                    }
                    Err(e) => warn!(process = %monitor_name, error = %e, "wait on managed process failed"),
                },
                _ = &mut kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(process = %monitor_name, error = %e, "kill failed");
                    }
                    let _ = child.wait().await;
                    debug!(process = %monitor_name, "managed process killed");
                }
            }
            // Supervisor may already be gone during shutdown.
            let _ = exits.send(SupervisorEvent::ProcessDisconnected).await;
        });

        Ok(Self {
            name,
            kill: Some(kill_tx),
        })
    }

    /// Ask the monitor to kill the child. Idempotent.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn definition(start_command: &str) -> ProcessDefinition {
        ProcessDefinition {
            name: "stainer".to_string(),
            start_command: start_command.to_string(),
            listen_addr: None,
            remote_login_allowed: true,
            remote_login_timeout_ms: 30_000,
            disconnect_window_ms: 60_000,
            max_disconnects: 1,
        }
    }

    #[tokio::test]
    async fn exit_is_reported_as_disconnect() {
        let (tx, mut rx) = mpsc::channel(4);
        let _process = ManagedProcess::spawn(&definition("true"), tx).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(SupervisorEvent::ProcessDisconnected));
    }

    #[tokio::test]
    async fn kill_terminates_a_long_runner() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut process = ManagedProcess::spawn(&definition("sleep 600"), tx).unwrap();
        process.kill();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(SupervisorEvent::ProcessDisconnected));
    }

    #[tokio::test]
    async fn missing_binary_is_a_start_failure() {
        let (tx, _rx) = mpsc::channel(4);
        let err = ManagedProcess::spawn(&definition("/no/such/binary-xyz"), tx).unwrap_err();
        assert!(matches!(err, MasterError::DeviceStartFailed(_)));
    }

    #[tokio::test]
    async fn empty_command_is_a_start_failure() {
        let (tx, _rx) = mpsc::channel(4);
        let err = ManagedProcess::spawn(&definition("   "), tx).unwrap_err();
        assert!(matches!(err, MasterError::DeviceStartFailed(_)));
    }
}
