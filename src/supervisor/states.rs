//! Supervisor state set: ids, events, context and the handler table.
//!
//! The five lifecycle states of a managed process:
//!
//! ```text
//!              ProcessConnected
//!   Wait ─────────────────────────> Working
//!    │ ▲                              │
//!    │ └──ProcessDisconnected──┐      │ ProcessDisconnected /
//!    │                         │      │ CommunicationError
//!    │ CannotStartDevice /     │      ▼
//!    │ TooManyRestarts      CommunicationRetry
//!    ▼                         │
//!  FatalError <────────────────┘ (TooManyRestarts, LoginTimeout)
//!
//!  any state ──StopRequested / PowerFail──> Final
//! ```
//!
//! `FatalError` is terminal except for an explicit stop; while in it (or in
//! `Final`) a stray peer connection is forcibly disconnected.

use crate::config::ProcessDefinition;
use crate::statemachine::{StateEvent, StateSet};
use crate::supervisor::SupervisorController;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// State identifiers of the process supervisor machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorStateId {
    /// Waiting for the managed process to come up and connect.
    Wait,
    /// Peer connected and ready; normal operation.
    Working,
    /// Communication fault; the process is being killed and restarted.
    CommunicationRetry,
    /// Unrecoverable; requires external reset.
    FatalError,
    /// Shutdown state, reached only through an explicit stop request.
    Final,
}

/// Events fed into the supervisor machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SupervisorEvent {
    /// Begin supervision: start the managed device/process.
    StartOperation = 0,
    /// The peer's TCP connection is up.
    ProcessConnected = 1,
    /// The peer's TCP connection dropped or the process exited.
    ProcessDisconnected = 2,
    /// A protocol-level communication fault.
    CommunicationError = 3,
    /// The managed device could not be started.
    CannotStartDevice = 4,
    /// The disconnect-flood guard tripped.
    TooManyRestarts = 5,
    /// The peer did not (re)connect within the login window.
    LoginTimeout = 6,
    /// Orderly shutdown requested.
    StopRequested = 7,
    /// Power failure signalled by the instrument.
    PowerFail = 8,
}

impl StateEvent for SupervisorEvent {
    fn index(&self) -> u32 {
        *self as u32
    }
}

/// Verdict of the disconnect-flood guard for one disconnect event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    /// Within policy; supervision continues.
    Tolerated,
    /// The allowed number of disconnects inside one window was exceeded.
    Flooded,
}

/// Counts disconnects inside a fixed window.
#[derive(Debug)]
pub struct DisconnectGuard {
    window: std::time::Duration,
    allowed: u32,
    count: u32,
    opened: Option<Instant>,
}

impl DisconnectGuard {
    pub fn new(window: std::time::Duration, allowed: u32) -> Self {
        Self {
            window,
            allowed,
            count: 0,
            opened: None,
        }
    }

    /// Record one disconnect at `now`.
    ///
    /// Opens a fresh window when none is open (or the old one has elapsed)
    /// and counts the event; inside an open window, exceeding the allowed
    /// count is a flood.
    pub fn register(&mut self, now: Instant) -> GuardVerdict {
        match self.opened {
            Some(opened) if now.duration_since(opened) < self.window => {
                if self.count >= self.allowed {
                    GuardVerdict::Flooded
                } else {
                    self.count += 1;
                    GuardVerdict::Tolerated
                }
            }
            _ => {
                self.opened = Some(now);
                self.count = 1;
                GuardVerdict::Tolerated
            }
        }
    }

    /// Whether a guard window is currently open.
    pub fn window_active(&self, now: Instant) -> bool {
        matches!(self.opened, Some(opened) if now.duration_since(opened) < self.window)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Per-process supervision record. Mutated only by the active state's
/// handler.
#[derive(Debug)]
pub struct ProcessContext {
    pub definition: ProcessDefinition,
    pub guard: DisconnectGuard,
}

impl ProcessContext {
    pub fn new(definition: ProcessDefinition) -> Self {
        let guard = DisconnectGuard::new(
            definition.disconnect_window(),
            definition.max_disconnects,
        );
        Self { definition, guard }
    }
}

/// The exhaustive handler set behind the supervisor's state machine.
///
/// Holds the supervision context and borrows the owning controller for the
/// machine's lifetime, so every handler can always reach it.
pub struct SupervisorStates<C: SupervisorController> {
    context: ProcessContext,
    controller: C,
    login_deadline: Option<Instant>,
    pending: VecDeque<SupervisorEvent>,
}

impl<C: SupervisorController> SupervisorStates<C> {
    pub fn new(definition: ProcessDefinition, controller: C) -> Self {
        Self {
            context: ProcessContext::new(definition),
            controller,
            login_deadline: None,
            pending: VecDeque::new(),
        }
    }

    /// Deadline of the armed login/guard timer, if any.
    pub fn login_deadline(&self) -> Option<Instant> {
        self.login_deadline
    }

    pub fn cancel_login_timer(&mut self) {
        self.login_deadline = None;
    }

    fn arm_login_timer(&mut self) {
        let timeout = self.context.definition.remote_login_timeout();
        self.login_deadline = Some(Instant::now() + timeout);
        debug!(
            process = %self.context.definition.name,
            timeout_ms = timeout.as_millis() as u64,
            "login timer armed"
        );
    }

    /// Next event a handler asked to have dispatched.
    pub fn take_pending(&mut self) -> Option<SupervisorEvent> {
        self.pending.pop_front()
    }

    pub fn context(&self) -> &ProcessContext {
        &self.context
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    fn process_name(&self) -> &str {
        &self.context.definition.name
    }
}

impl<C: SupervisorController> StateSet for SupervisorStates<C> {
    type Id = SupervisorStateId;
    type Event = SupervisorEvent;

    fn on_entry(&mut self, state: SupervisorStateId, event: &SupervisorEvent) -> bool {
        match state {
            SupervisorStateId::Wait => {
                debug!(process = %self.process_name(), "waiting for peer");
                true
            }
            SupervisorStateId::Working => {
                self.cancel_login_timer();
                self.controller.on_go_received();
                self.controller.on_ready_to_work();
                true
            }
            SupervisorStateId::CommunicationRetry => {
                warn!(process = %self.process_name(), ?event, "communication fault, restarting process");
                match self.controller.kill_and_restart(&self.context.definition) {
                    Ok(()) => {
                        self.arm_login_timer();
                        true
                    }
                    Err(e) => {
                        error!(process = %self.process_name(), error = %e, "restart failed");
                        self.pending.push_back(SupervisorEvent::CannotStartDevice);
                        false
                    }
                }
            }
            SupervisorStateId::FatalError => {
                self.cancel_login_timer();
                error!(
                    process = %self.process_name(),
                    ?event,
                    "supervisor entered fatal state; external reset required"
                );
                true
            }
            SupervisorStateId::Final => {
                self.cancel_login_timer();
                if *event == SupervisorEvent::PowerFail {
                    self.controller.on_power_fail();
                }
                debug!(process = %self.process_name(), "supervision finished");
                true
            }
        }
    }

    fn on_exit(&mut self, state: SupervisorStateId, _event: &SupervisorEvent) -> bool {
        match state {
            SupervisorStateId::Working => {
                // Leaving Working for any reason means work must stop.
                self.controller.on_stop_received();
                true
            }
            _ => true,
        }
    }

    fn handle_event(&mut self, state: SupervisorStateId, event: &SupervisorEvent) -> bool {
        match (state, event) {
            (SupervisorStateId::Wait, SupervisorEvent::StartOperation) => {
                match self.controller.start_device(&self.context.definition) {
                    Ok(()) => {
                        self.arm_login_timer();
                        true
                    }
                    Err(e) => {
                        error!(process = %self.process_name(), error = %e, "cannot start device");
                        self.pending.push_back(SupervisorEvent::CannotStartDevice);
                        false
                    }
                }
            }
            (SupervisorStateId::Wait, SupervisorEvent::ProcessDisconnected) => {
                match self.context.guard.register(Instant::now()) {
                    GuardVerdict::Flooded => {
                        warn!(
                            process = %self.process_name(),
                            count = self.context.guard.count(),
                            "disconnect flood detected"
                        );
                        self.pending.push_back(SupervisorEvent::TooManyRestarts);
                    }
                    GuardVerdict::Tolerated => {
                        self.arm_login_timer();
                    }
                }
                true
            }
            (
                SupervisorStateId::FatalError | SupervisorStateId::Final,
                SupervisorEvent::ProcessConnected,
            ) => {
                warn!(process = %self.process_name(), "disconnecting stray peer connection");
                match self.controller.disconnect_peer() {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(process = %self.process_name(), error = %e, "could not disconnect peer");
                        false
                    }
                }
            }
            _ => {
                debug!(process = %self.process_name(), ?state, ?event, "event ignored in state");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn guard() -> DisconnectGuard {
        DisconnectGuard::new(Duration::from_secs(60), 1)
    }

    #[tokio::test(start_paused = true)]
    async fn single_disconnect_is_tolerated() {
        let mut guard = guard();
        assert_eq!(guard.register(Instant::now()), GuardVerdict::Tolerated);
        assert!(guard.window_active(Instant::now()));
        assert_eq!(guard.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_disconnect_inside_window_floods() {
        let mut guard = guard();
        assert_eq!(guard.register(Instant::now()), GuardVerdict::Tolerated);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(guard.register(Instant::now()), GuardVerdict::Flooded);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_resets_the_count() {
        let mut guard = guard();
        assert_eq!(guard.register(Instant::now()), GuardVerdict::Tolerated);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(guard.register(Instant::now()), GuardVerdict::Flooded);
        tokio::time::advance(Duration::from_secs(61)).await;
        // New window: tolerated again.
        assert_eq!(guard.register(Instant::now()), GuardVerdict::Tolerated);
        assert_eq!(guard.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn higher_threshold_tolerates_more() {
        let mut guard = DisconnectGuard::new(Duration::from_secs(60), 3);
        for _ in 0..3 {
            assert_eq!(guard.register(Instant::now()), GuardVerdict::Tolerated);
        }
        assert_eq!(guard.register(Instant::now()), GuardVerdict::Flooded);
    }
}
