//! Core types for the tether object bus.
//!
//! This crate defines the data every other tether crate agrees on: type
//! signatures, dynamic values, meta objects, object identity, endpoint
//! configuration and the shared error type. It performs no I/O.

pub mod config;
pub mod error;
pub mod meta;
pub mod object;
pub mod signature;
pub mod value;

pub use config::EndpointConfig;
pub use error::{Error, Result};
pub use meta::{
    ActionId, MetaAction, MetaObject, MetaObjectBuilder, MetaProperty, MetaSignal, PropertyId,
    SignalId, FIRST_USER_ID,
};
pub use object::{EndpointId, ObjectHandle, ObjectRef, ObjectUid};
pub use signature::Signature;
pub use value::{DynamicValue, FromValue, IntoValue, Reflect};
