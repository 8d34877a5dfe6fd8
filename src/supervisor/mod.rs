//! Per-process supervision.
//!
//! One [`ProcessSupervisor`] task runs per managed external process. It owns
//! a [`StateMachine`] over [`SupervisorStates`] and consumes
//! [`SupervisorEvent`]s from its mailbox; connection and protocol events are
//! translated into machine events by the master context. The supervisor also
//! owns the login timer: armed whenever the machine is waiting for the peer
//! to (re)connect, cancelled on entry to `Working`.
//!
//! Side effects on the outside world go through [`SupervisorController`].
//! [`DeviceController`] is the production implementation: it spawns and kills
//! the managed process and reports lifecycle notices upward; tests substitute
//! a recording stub.

pub mod process;
pub mod states;

pub use process::ManagedProcess;
pub use states::{
    DisconnectGuard, GuardVerdict, ProcessContext, SupervisorEvent, SupervisorStateId,
    SupervisorStates,
};

use crate::config::ProcessDefinition;
use crate::error::{MasterError, MasterResult};
use crate::messages::{Acknowledge, Ref};
use crate::network::link::LinkHandle;
use crate::statemachine::{StateEvent, StateMachine};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Used when no login timer is armed, so the select arm stays disabled.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Side-effect seam of the supervisor machine.
///
/// Action methods may fail; the failure is logged by the state handlers and,
/// for start/restart, converted into a `CannotStartDevice` event. Lifecycle
/// hooks are notifications and cannot fail.
pub trait SupervisorController {
    /// Start the managed device process.
    fn start_device(&mut self, definition: &ProcessDefinition) -> MasterResult<()>;
    /// Kill the managed process and start a fresh instance.
    fn kill_and_restart(&mut self, definition: &ProcessDefinition) -> MasterResult<()>;
    /// Forcibly drop the peer's connection.
    fn disconnect_peer(&mut self) -> MasterResult<()>;

    /// The peer has logged in; operation may begin.
    fn on_go_received(&mut self);
    /// The peer is fully ready for work.
    fn on_ready_to_work(&mut self);
    /// Outstanding work must stop.
    fn on_stop_received(&mut self);
    /// The instrument reported a power failure.
    fn on_power_fail(&mut self);
}

/// Lifecycle and protocol notices reported by a [`DeviceController`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerNotice {
    /// The peer logged in; operation may begin.
    Go { process: String },
    /// The peer is ready for work.
    ReadyToWork { process: String },
    /// Work for this process must stop.
    WorkStopped { process: String },
    /// Power failure propagated to this process.
    PowerFail { process: String },
    /// A command sent to this process was acknowledged.
    CommandAcknowledged { process: String, ack: Acknowledge },
    /// A command sent to this process ran out its acknowledge timer.
    CommandTimedOut {
        process: String,
        reference: Ref,
        name: String,
    },
}

/// Shared slot the master uses to hand the active peer link to a controller.
pub type LinkSlot = Arc<Mutex<Option<LinkHandle>>>;

/// Production controller: owns the managed child process and the link slot.
pub struct DeviceController {
    name: String,
    exits: mpsc::Sender<SupervisorEvent>,
    process: Option<ManagedProcess>,
    link: LinkSlot,
    notices: mpsc::UnboundedSender<ControllerNotice>,
}

impl DeviceController {
    /// `exits` feeds process-death events back into the supervisor mailbox;
    /// `notices` carries lifecycle reports up to the master context.
    pub fn new(
        name: impl Into<String>,
        exits: mpsc::Sender<SupervisorEvent>,
        notices: mpsc::UnboundedSender<ControllerNotice>,
    ) -> Self {
        Self {
            name: name.into(),
            exits,
            process: None,
            link: Arc::new(Mutex::new(None)),
            notices,
        }
    }

    /// The slot the master fills with the peer's [`LinkHandle`] on accept.
    pub fn link_slot(&self) -> LinkSlot {
        Arc::clone(&self.link)
    }

    fn notify(&self, notice: ControllerNotice) {
        if self.notices.send(notice).is_err() {
            debug!(process = %self.name, "notice receiver gone");
        }
    }
}

impl SupervisorController for DeviceController {
    fn start_device(&mut self, definition: &ProcessDefinition) -> MasterResult<()> {
        self.process = Some(ManagedProcess::spawn(definition, self.exits.clone())?);
        Ok(())
    }

    fn kill_and_restart(&mut self, definition: &ProcessDefinition) -> MasterResult<()> {
        if let Some(process) = &mut self.process {
            process.kill();
        }
        self.process = Some(ManagedProcess::spawn(definition, self.exits.clone())?);
        Ok(())
    }

    fn disconnect_peer(&mut self) -> MasterResult<()> {
        let guard = self
            .link
            .lock()
            .map_err(|_| MasterError::Protocol("link slot poisoned".to_string()))?;
        match guard.as_ref() {
            Some(link) => {
                link.close();
                Ok(())
            }
            None => Err(MasterError::Protocol(format!(
                "process '{}' has no peer link to disconnect",
                self.name
            ))),
        }
    }

    fn on_go_received(&mut self) {
        self.notify(ControllerNotice::Go {
            process: self.name.clone(),
        });
    }

    fn on_ready_to_work(&mut self) {
        self.notify(ControllerNotice::ReadyToWork {
            process: self.name.clone(),
        });
    }

    fn on_stop_received(&mut self) {
        self.notify(ControllerNotice::WorkStopped {
            process: self.name.clone(),
        });
    }

    fn on_power_fail(&mut self) {
        self.notify(ControllerNotice::PowerFail {
            process: self.name.clone(),
        });
    }
}

/// Handle for feeding events into a running supervisor and observing its
/// state.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorEvent>,
    state: watch::Receiver<Option<SupervisorStateId>>,
}

impl SupervisorHandle {
    /// Queue an event for the supervisor machine.
    pub async fn dispatch(&self, event: SupervisorEvent) -> MasterResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| MasterError::ChannelNotBound)
    }

    /// Best-effort dispatch from non-async contexts.
    pub fn try_dispatch(&self, event: SupervisorEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "supervisor event dropped");
        }
    }

    /// A sender usable as a process-exit feedback channel.
    pub fn event_sender(&self) -> mpsc::Sender<SupervisorEvent> {
        self.tx.clone()
    }

    /// Current machine state, `None` until the supervisor task starts.
    pub fn state(&self) -> Option<SupervisorStateId> {
        *self.state.borrow()
    }

    /// Wait until the machine reaches `target`. Returns false if the
    /// supervisor task ended first.
    pub async fn wait_for(&mut self, target: SupervisorStateId) -> bool {
        loop {
            if *self.state.borrow_and_update() == Some(target) {
                return true;
            }
            if self.state.changed().await.is_err() {
                return false;
            }
        }
    }
}

/// The supervisor task: one state machine, one mailbox, one login timer.
pub struct ProcessSupervisor<C: SupervisorController> {
    machine: StateMachine<SupervisorStates<C>>,
    events: mpsc::Receiver<SupervisorEvent>,
    state_tx: watch::Sender<Option<SupervisorStateId>>,
    name: String,
}

impl<C: SupervisorController> ProcessSupervisor<C> {
    /// Build a supervisor for `definition` with its transition table
    /// registered. Run it with [`ProcessSupervisor::run`].
    pub fn new(
        definition: ProcessDefinition,
        controller: C,
        mailbox_capacity: usize,
    ) -> (SupervisorHandle, Self) {
        let (tx, events) = mpsc::channel(mailbox_capacity);
        Self::from_parts(definition, controller, tx, events)
    }

    /// Build around an externally created mailbox, so the controller can be
    /// given the event sender before the supervisor exists.
    pub fn from_parts(
        definition: ProcessDefinition,
        controller: C,
        tx: mpsc::Sender<SupervisorEvent>,
        events: mpsc::Receiver<SupervisorEvent>,
    ) -> (SupervisorHandle, Self) {
        let (state_tx, state_rx) = watch::channel(None);
        let name = definition.name.clone();
        let machine = Self::build_machine(definition, controller);
        (
            SupervisorHandle {
                tx,
                state: state_rx,
            },
            Self {
                machine,
                events,
                state_tx,
                name,
            },
        )
    }

    fn build_machine(
        definition: ProcessDefinition,
        controller: C,
    ) -> StateMachine<SupervisorStates<C>> {
        use SupervisorEvent as E;
        use SupervisorStateId as S;

        let mut machine = StateMachine::new(SupervisorStates::new(definition, controller));
        for state in [
            S::Wait,
            S::Working,
            S::CommunicationRetry,
            S::FatalError,
            S::Final,
        ] {
            machine.add_state(state);
        }

        machine.add_transition(S::Wait, S::Working, E::ProcessConnected.index());
        machine.add_transition(S::Wait, S::FatalError, E::CannotStartDevice.index());
        machine.add_transition(S::Wait, S::FatalError, E::TooManyRestarts.index());
        machine.add_transition(S::Wait, S::CommunicationRetry, E::LoginTimeout.index());

        machine.add_transition(S::Working, S::CommunicationRetry, E::ProcessDisconnected.index());
        machine.add_transition(S::Working, S::CommunicationRetry, E::CommunicationError.index());

        machine.add_transition(S::CommunicationRetry, S::Working, E::ProcessConnected.index());
        machine.add_transition(S::CommunicationRetry, S::Wait, E::ProcessDisconnected.index());
        machine.add_transition(S::CommunicationRetry, S::FatalError, E::CannotStartDevice.index());
        machine.add_transition(S::CommunicationRetry, S::FatalError, E::TooManyRestarts.index());
        machine.add_transition(S::CommunicationRetry, S::FatalError, E::LoginTimeout.index());

        for from in [S::Wait, S::Working, S::CommunicationRetry, S::FatalError] {
            machine.add_transition(from, S::Final, E::StopRequested.index());
        }
        for from in [S::Wait, S::Working, S::CommunicationRetry, S::FatalError] {
            machine.add_transition(from, S::Final, E::PowerFail.index());
        }

        machine
    }

    /// Run until the last [`SupervisorHandle`] is dropped.
    pub async fn run(mut self) {
        if !self
            .machine
            .start(SupervisorStateId::Wait, &SupervisorEvent::StartOperation)
        {
            error!(process = %self.name, "supervisor machine failed to start");
            return;
        }
        self.publish();
        info!(process = %self.name, "supervisor running");

        loop {
            let login_deadline = self.machine.set().login_deadline();
            let deadline = login_deadline.unwrap_or_else(|| Instant::now() + IDLE_SLEEP);

            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.machine.dispatch(&event);
                    self.drain_pending();
                    self.publish();
                }
                () = sleep_until(deadline), if login_deadline.is_some() => {
                    warn!(process = %self.name, "peer login window elapsed");
                    self.machine.set_mut().cancel_login_timer();
                    self.machine.dispatch(&SupervisorEvent::LoginTimeout);
                    self.drain_pending();
                    self.publish();
                }
            }
        }

        self.machine.stop();
        debug!(process = %self.name, "supervisor stopped");
    }

    /// Dispatch events queued by handlers during the last dispatch.
    fn drain_pending(&mut self) {
        while let Some(event) = self.machine.set_mut().take_pending() {
            self.machine.dispatch(&event);
        }
    }

    fn publish(&self) {
        self.state_tx.send_if_modified(|state| {
            let current = self.machine.current();
            if *state == current {
                false
            } else {
                *state = current;
                true
            }
        });
    }
}
