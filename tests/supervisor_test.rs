//! Integration tests for the process supervisor actor.
//!
//! A recording controller stands in for the real device controller; the
//! tests drive the supervisor through its mailbox and observe state through
//! the handle's watch channel. Timers run on the paused clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use stain_master::config::ProcessDefinition;
use stain_master::error::{MasterError, MasterResult};
use stain_master::supervisor::{
    ProcessSupervisor, SupervisorController, SupervisorEvent, SupervisorHandle, SupervisorStateId,
};

#[derive(Clone, Default)]
struct RecordingController {
    calls: Arc<Mutex<Vec<String>>>,
    fail_start: bool,
}

impl RecordingController {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

impl SupervisorController for RecordingController {
    fn start_device(&mut self, _definition: &ProcessDefinition) -> MasterResult<()> {
        self.record("start");
        if self.fail_start {
            return Err(MasterError::DeviceStartFailed("no binary".to_string()));
        }
        Ok(())
    }

    fn kill_and_restart(&mut self, _definition: &ProcessDefinition) -> MasterResult<()> {
        self.record("restart");
        Ok(())
    }

    fn disconnect_peer(&mut self) -> MasterResult<()> {
        self.record("disconnect");
        Ok(())
    }

    fn on_go_received(&mut self) {
        self.record("go");
    }

    fn on_ready_to_work(&mut self) {
        self.record("ready");
    }

    fn on_stop_received(&mut self) {
        self.record("stop");
    }

    fn on_power_fail(&mut self) {
        self.record("power_fail");
    }
}

fn definition() -> ProcessDefinition {
    ProcessDefinition {
        name: "gui".to_string(),
        start_command: "/usr/bin/stainer-gui".to_string(),
        listen_addr: None,
        remote_login_allowed: true,
        // Long login window so guard tests are not disturbed by the timer.
        remote_login_timeout_ms: 600_000,
        disconnect_window_ms: 60_000,
        max_disconnects: 1,
    }
}

fn spawn(controller: RecordingController) -> SupervisorHandle {
    let (handle, supervisor) = ProcessSupervisor::new(definition(), controller, 16);
    tokio::spawn(supervisor.run());
    handle
}

/// Let the supervisor task drain its mailbox before the clock moves on.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn failed_device_start_is_fatal_exactly_once() {
    let controller = RecordingController {
        fail_start: true,
        ..Default::default()
    };
    let mut handle = spawn(controller.clone());

    handle
        .dispatch(SupervisorEvent::StartOperation)
        .await
        .unwrap();
    assert!(handle.wait_for(SupervisorStateId::FatalError).await);
    assert_eq!(controller.calls(), vec!["start"]);
}

#[tokio::test(start_paused = true)]
async fn disconnect_flood_within_window_is_fatal() {
    let controller = RecordingController::default();
    let mut handle = spawn(controller.clone());
    handle
        .dispatch(SupervisorEvent::StartOperation)
        .await
        .unwrap();
    settle().await;

    handle
        .dispatch(SupervisorEvent::ProcessDisconnected)
        .await
        .unwrap();
    settle().await;
    assert_eq!(handle.state(), Some(SupervisorStateId::Wait));

    tokio::time::advance(Duration::from_secs(5)).await;
    handle
        .dispatch(SupervisorEvent::ProcessDisconnected)
        .await
        .unwrap();
    assert!(handle.wait_for(SupervisorStateId::FatalError).await);
}

#[tokio::test(start_paused = true)]
async fn spaced_disconnects_stay_within_policy() {
    let controller = RecordingController::default();
    let mut handle = spawn(controller.clone());
    handle
        .dispatch(SupervisorEvent::StartOperation)
        .await
        .unwrap();
    settle().await;

    handle
        .dispatch(SupervisorEvent::ProcessDisconnected)
        .await
        .unwrap();
    settle().await;

    // Guard window elapses before the next disconnect.
    tokio::time::advance(Duration::from_secs(61)).await;
    handle
        .dispatch(SupervisorEvent::ProcessDisconnected)
        .await
        .unwrap();
    settle().await;

    assert_eq!(handle.state(), Some(SupervisorStateId::Wait));
    assert!(!controller.calls().contains(&"disconnect".to_string()));
    drop(handle);
}

#[tokio::test(start_paused = true)]
async fn communication_error_restarts_and_reconnect_resumes() {
    let controller = RecordingController::default();
    let mut handle = spawn(controller.clone());

    handle
        .dispatch(SupervisorEvent::StartOperation)
        .await
        .unwrap();
    handle
        .dispatch(SupervisorEvent::ProcessConnected)
        .await
        .unwrap();
    assert!(handle.wait_for(SupervisorStateId::Working).await);

    handle
        .dispatch(SupervisorEvent::CommunicationError)
        .await
        .unwrap();
    assert!(handle.wait_for(SupervisorStateId::CommunicationRetry).await);
    assert_eq!(
        controller.calls(),
        vec!["start", "go", "ready", "stop", "restart"]
    );

    handle
        .dispatch(SupervisorEvent::ProcessConnected)
        .await
        .unwrap();
    assert!(handle.wait_for(SupervisorStateId::Working).await);
}

#[tokio::test(start_paused = true)]
async fn stray_connection_after_stop_is_dropped() {
    let controller = RecordingController::default();
    let mut handle = spawn(controller.clone());

    handle
        .dispatch(SupervisorEvent::StartOperation)
        .await
        .unwrap();
    handle
        .dispatch(SupervisorEvent::StopRequested)
        .await
        .unwrap();
    assert!(handle.wait_for(SupervisorStateId::Final).await);

    handle
        .dispatch(SupervisorEvent::ProcessConnected)
        .await
        .unwrap();
    settle().await;
    assert_eq!(handle.state(), Some(SupervisorStateId::Final));
    assert!(controller.calls().contains(&"disconnect".to_string()));
}

#[tokio::test(start_paused = true)]
async fn no_reconnect_during_retry_is_fatal() {
    let controller = RecordingController::default();
    let mut handle = spawn(controller.clone());

    handle
        .dispatch(SupervisorEvent::StartOperation)
        .await
        .unwrap();
    handle
        .dispatch(SupervisorEvent::ProcessConnected)
        .await
        .unwrap();
    handle
        .dispatch(SupervisorEvent::ProcessDisconnected)
        .await
        .unwrap();
    assert!(handle.wait_for(SupervisorStateId::CommunicationRetry).await);

    // Nobody reconnects; a login timeout during retry is fatal.
    assert!(handle.wait_for(SupervisorStateId::FatalError).await);
    assert_eq!(
        controller.calls(),
        vec!["start", "go", "ready", "stop", "restart"]
    );
}
