//! Generic finite-state-machine engine.
//!
//! The engine owns a set of named states and a transition table
//! `(state, event index) -> state`. Dispatching an event either follows a
//! registered transition (running the old state's exit handler and the new
//! state's entry handler) or, when no transition matches, routes the event to
//! the active state's internal handler.
//!
//! Concrete machines implement [`StateSet`] once, matching exhaustively over
//! their state id, instead of subclassing a virtual state type per state.
//! Handler failures are logged here and never propagated across the engine
//! boundary.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──> add_state/add_transition ──> start() ──> dispatch()* ──> stop()
//! ```
//!
//! While stopped, dispatched events are rejected with a logged warning, a
//! documented no-op rather than a silent loss. `stop()` does not run the active
//! state's exit handler; teardown is expected to follow immediately.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use tracing::{debug, warn};

/// An event a state machine can consume. The index keys the transition table.
pub trait StateEvent {
    /// Stable discriminant used in the transition table.
    fn index(&self) -> u32;
}

/// The states of one machine, implemented as a single exhaustive handler set.
pub trait StateSet {
    /// State identifier (typically a fieldless enum).
    type Id: Copy + Eq + Hash + fmt::Debug;
    /// Event type consumed by this machine.
    type Event: StateEvent + fmt::Debug;

    /// Invoked after the machine switches into `state`.
    fn on_entry(&mut self, state: Self::Id, event: &Self::Event) -> bool;
    /// Invoked before the machine switches away from `state`.
    fn on_exit(&mut self, state: Self::Id, event: &Self::Event) -> bool;
    /// Invoked for events with no registered transition out of `state`.
    fn handle_event(&mut self, state: Self::Id, event: &Self::Event) -> bool;
}

/// The engine: state set, transition table, current state and run flag.
pub struct StateMachine<S: StateSet> {
    set: S,
    states: HashSet<S::Id>,
    transitions: HashMap<(S::Id, u32), S::Id>,
    current: Option<S::Id>,
    running: bool,
}

impl<S: StateSet> StateMachine<S> {
    pub fn new(set: S) -> Self {
        Self {
            set,
            states: HashSet::new(),
            transitions: HashMap::new(),
            current: None,
            running: false,
        }
    }

    /// Register a state. Setup-time only; returns false if already present.
    pub fn add_state(&mut self, state: S::Id) -> bool {
        self.states.insert(state)
    }

    /// Remove a state and every transition that touches it.
    pub fn remove_state(&mut self, state: S::Id) -> bool {
        if !self.states.remove(&state) {
            return false;
        }
        self.transitions
            .retain(|(from, _), to| *from != state && *to != state);
        true
    }

    /// Register `from --event_index--> to`. Both states must be known.
    pub fn add_transition(&mut self, from: S::Id, to: S::Id, event_index: u32) -> bool {
        if !self.states.contains(&from) || !self.states.contains(&to) {
            warn!(?from, ?to, event_index, "transition references unknown state");
            return false;
        }
        self.transitions.insert((from, event_index), to);
        true
    }

    /// Remove a registered transition.
    pub fn remove_transition(&mut self, from: S::Id, event_index: u32) -> bool {
        self.transitions.remove(&(from, event_index)).is_some()
    }

    /// Enter the initial state and start consuming events.
    ///
    /// Fails (returns false) if the named state is unknown.
    pub fn start(&mut self, initial: S::Id, event: &S::Event) -> bool {
        if !self.states.contains(&initial) {
            warn!(?initial, "cannot start: unknown initial state");
            return false;
        }
        self.current = Some(initial);
        self.running = true;
        debug!(?initial, "state machine started");
        if !self.set.on_entry(initial, event) {
            warn!(?initial, ?event, "entry handler reported failure");
        }
        true
    }

    /// Feed one event into the machine.
    ///
    /// Returns false when the machine is stopped or not started, or when the
    /// invoked handlers reported failure. Handler failures are logged, never
    /// raised.
    pub fn dispatch(&mut self, event: &S::Event) -> bool {
        if !self.running {
            warn!(?event, "event dispatched to stopped state machine");
            return false;
        }
        let Some(current) = self.current else {
            warn!(?event, "event dispatched before start");
            return false;
        };

        match self.transitions.get(&(current, event.index())).copied() {
            Some(next) => {
                let mut ok = self.set.on_exit(current, event);
                if !ok {
                    warn!(state = ?current, ?event, "exit handler reported failure");
                }
                self.current = Some(next);
                debug!(from = ?current, to = ?next, ?event, "state transition");
                if !self.set.on_entry(next, event) {
                    warn!(state = ?next, ?event, "entry handler reported failure");
                    ok = false;
                }
                ok
            }
            None => {
                let ok = self.set.handle_event(current, event);
                if !ok {
                    warn!(state = ?current, ?event, "event handler reported failure");
                }
                ok
            }
        }
    }

    /// Stop consuming events.
    ///
    /// The active state's exit handler is not run; process teardown is
    /// expected to follow immediately.
    pub fn stop(&mut self) {
        self.running = false;
        debug!(state = ?self.current, "state machine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The active state, if the machine has been started.
    pub fn current(&self) -> Option<S::Id> {
        self.current
    }

    /// Access the handler set (e.g. to read machine context).
    pub fn set(&self) -> &S {
        &self.set
    }

    /// Mutable access to the handler set.
    pub fn set_mut(&mut self) -> &mut S {
        &mut self.set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum DoorState {
        Closed,
        Open,
    }

    #[derive(Debug)]
    enum DoorEvent {
        Open,
        Close,
        Knock,
    }

    impl StateEvent for DoorEvent {
        fn index(&self) -> u32 {
            match self {
                DoorEvent::Open => 0,
                DoorEvent::Close => 1,
                DoorEvent::Knock => 2,
            }
        }
    }

    #[derive(Default)]
    struct DoorStates {
        log: Vec<String>,
    }

    impl StateSet for DoorStates {
        type Id = DoorState;
        type Event = DoorEvent;

        fn on_entry(&mut self, state: DoorState, _event: &DoorEvent) -> bool {
            self.log.push(format!("enter {state:?}"));
            true
        }

        fn on_exit(&mut self, state: DoorState, _event: &DoorEvent) -> bool {
            self.log.push(format!("exit {state:?}"));
            true
        }

        fn handle_event(&mut self, state: DoorState, event: &DoorEvent) -> bool {
            self.log.push(format!("handle {event:?} in {state:?}"));
            matches!(event, DoorEvent::Knock)
        }
    }

    fn door_machine() -> StateMachine<DoorStates> {
        let mut machine = StateMachine::new(DoorStates::default());
        machine.add_state(DoorState::Closed);
        machine.add_state(DoorState::Open);
        machine.add_transition(DoorState::Closed, DoorState::Open, DoorEvent::Open.index());
        machine.add_transition(DoorState::Open, DoorState::Closed, DoorEvent::Close.index());
        machine
    }

    #[test]
    fn start_fails_for_unknown_state() {
        let mut machine = StateMachine::new(DoorStates::default());
        assert!(!machine.start(DoorState::Closed, &DoorEvent::Knock));
        assert_eq!(machine.current(), None);
    }

    #[test]
    fn transition_runs_exit_then_entry() {
        let mut machine = door_machine();
        assert!(machine.start(DoorState::Closed, &DoorEvent::Knock));
        assert!(machine.dispatch(&DoorEvent::Open));
        assert_eq!(machine.current(), Some(DoorState::Open));
        assert_eq!(
            machine.set().log,
            vec!["enter Closed", "exit Closed", "enter Open"]
        );
    }

    #[test]
    fn unhandled_event_routes_to_state_handler() {
        let mut machine = door_machine();
        machine.start(DoorState::Closed, &DoorEvent::Knock);
        assert!(machine.dispatch(&DoorEvent::Knock));
        assert_eq!(machine.current(), Some(DoorState::Closed));
        assert_eq!(machine.set().log.last().unwrap(), "handle Knock in Closed");
    }

    #[test]
    fn dispatch_after_stop_always_fails_and_runs_no_handler() {
        let mut machine = door_machine();
        machine.start(DoorState::Closed, &DoorEvent::Knock);
        let handler_calls = machine.set().log.len();
        machine.stop();
        assert!(!machine.dispatch(&DoorEvent::Open));
        assert!(!machine.dispatch(&DoorEvent::Knock));
        // No exit handler on stop, no handlers after stop.
        assert_eq!(machine.set().log.len(), handler_calls);
        assert_eq!(machine.current(), Some(DoorState::Closed));
    }

    #[test]
    fn removed_transition_no_longer_fires() {
        let mut machine = door_machine();
        machine.start(DoorState::Closed, &DoorEvent::Knock);
        assert!(machine.remove_transition(DoorState::Closed, DoorEvent::Open.index()));
        assert!(!machine.dispatch(&DoorEvent::Open));
        assert_eq!(machine.current(), Some(DoorState::Closed));
    }

    #[test]
    fn remove_state_drops_its_transitions() {
        let mut machine = door_machine();
        assert!(machine.remove_state(DoorState::Open));
        assert!(!machine.add_transition(
            DoorState::Closed,
            DoorState::Open,
            DoorEvent::Open.index()
        ));
    }
}
