//! Execution layer of the tether object bus.
//!
//! - [`Future`] / [`Promise`]: one-shot results shared between a producer
//!   and any number of readers
//! - [`DynamicObject`]: a meta object plus either a local dispatch table or
//!   a [`RemoteBackend`] that forwards to another endpoint
//! - [`ObjectBuilder`]: declares actions, signals and properties and binds
//!   native handlers to them
//! - [`Strand`]: sequential execution for objects whose handlers are not
//!   reentrant

pub mod builder;
pub mod future;
pub mod object;
pub mod strand;

pub use builder::ObjectBuilder;
pub use future::{Future, Promise, WaitOutcome};
pub use object::{
    ActionHandler, AnyObject, DynamicObject, RemoteBackend, SignalHandler, SubscriptionId,
    WeakObject,
};
pub use strand::Strand;
