//! Actor-based event dispatch.
//!
//! ## Design Principles
//!
//! - **One worker per key**: events for one role, or for one instance, are
//!   handled by a single worker in arrival order
//! - **Concurrency across keys**: workers for different keys run in parallel
//! - **Short-lived instance workers**: an instance worker stops after the
//!   instance is removed; a later event for the key starts a fresh one
//!
//! ## Actor Types
//!
//! - `KeyedWorker`: applies the events of one dispatch key to the engine
//! - `EventDispatcher`: routes events to workers and owns their tasks

mod dispatcher;
mod framework;
mod worker;

pub use dispatcher::EventDispatcher;
pub use framework::{
    Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, Message, Supervisor,
};
pub use worker::{ControllerEvent, DispatchKey, Envelope, KeyedWorker};
