//! # Stain Master Core Library
//!
//! Supervisory kernel of the staining instrument's Master process. The
//! Master starts the instrument's external processes (GUI, remote care,
//! slide handling), watches their liveness over acknowledged XML protocol
//! links, and restarts or fails them according to a per-process state
//! machine.
//!
//! ## Crate Structure
//!
//! - **`messages`**: the correlated command/acknowledge data model; every
//!   request carries a process-unique [`messages::Ref`].
//! - **`dispatch`**: the bounded in-process channel pairing one requester
//!   with one executor, FIFO per direction, one reply per reference.
//! - **`statemachine`**: the generic FSM engine; concrete machines
//!   implement [`statemachine::StateSet`] once.
//! - **`supervisor`**: per-process supervision: lifecycle state machine,
//!   disconnect-flood guard, login timer, managed child process.
//! - **`network`**: the wire side: XML envelopes, the per-connection link
//!   actor with acknowledge deadlines and heartbeats, and the message
//!   catalog used to validate inbound frames.
//! - **`master`**: the explicitly constructed root context tying the above
//!   together; owns all tasks, no globals.
//! - **`config`**: TOML + environment configuration (figment).
//! - **`error`**: the central [`error::MasterError`] enum.
//! - **`tracing_setup`**: tracing-subscriber initialization.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod master;
pub mod messages;
pub mod network;
pub mod statemachine;
pub mod supervisor;
pub mod tracing_setup;

pub use config::MasterConfig;
pub use error::{MasterError, MasterResult};
pub use master::Master;
