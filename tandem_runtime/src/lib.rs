//! Node runtime for a tandem federation: the envelope protocol, the blocking
//! node mailbox, interface bookkeeping, the time coordinator, the federate
//! state machine, and the core multiplexer.

#![deny(clippy::all)]

mod action;
pub mod coordinator;
mod core;
mod fedstate;
mod federate;
pub mod interfaces;
mod mailbox;
mod message;
mod profiler;
pub mod registry;
pub mod route;

// Re-exports
pub use action::Action;
pub use self::core::Core;
pub use coordinator::{TimeCoordinator, TimeError, TimeProperties};
pub use federate::{Federate, TimeProperty};
pub use fedstate::{FederateError, FederatePhase, FederateState};
pub use mailbox::Mailbox;
pub use message::{ActionMessage, CodecError, ExtraInfo, Flags, MAX_PAYLOAD_SIZE};
pub use profiler::ProfilerBuffer;
