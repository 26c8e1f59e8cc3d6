//! Tether wire protocol.
//!
//! Endpoints exchange length-prefixed frames over any ordered byte stream.
//! A connection starts with a JSON handshake that exchanges identities
//! (and an HMAC proof when a shared secret is configured), then switches to
//! binary frames carrying calls, replies, errors, events and lookups.
//!
//! Objects passed as arguments or results travel by reference: the sender
//! exports them under a route and the receiver builds a proxy that forwards
//! every operation back over the connection.

pub mod codec;
pub mod connection;
pub mod control;
pub mod endpoint;
pub mod event;
pub mod frame;
pub mod message;
pub mod proxy;
pub mod registry;
pub mod url;

pub use connection::{Connection, ConnectionId, ConnectionState, PeerInfo};
pub use endpoint::Endpoint;
pub use event::{EndpointEvent, EndpointEventKind};
pub use frame::{CorrelationId, Frame, FrameKind};
pub use registry::ServiceId;
pub use url::Url;
