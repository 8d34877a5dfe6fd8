//! In-process dispatch channels.
//!
//! A dispatch channel is the only way two controller tasks talk to each
//! other: commands travel one way, acknowledges travel back the other way
//! on the same channel. See [`channel::DispatchChannel`].

pub mod channel;

pub use channel::{DispatchChannel, DispatchError, ExecutorEnd, ReplyHandle, RequesterEnd};
