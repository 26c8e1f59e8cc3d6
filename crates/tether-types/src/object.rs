//! Object identity and the type-erased handle stored inside values.
//!
//! The concrete object type lives in `tether-runtime`; values only need to
//! know an object's identity and callable surface, so they hold an
//! [`ObjectRef`] over the [`ObjectHandle`] trait.

use crate::meta::MetaObject;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub Uuid);

impl EndpointId {
    /// Create a new random EndpointId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an object, shared by the object and every proxy standing
/// for it on other endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectUid(pub Uuid);

impl ObjectUid {
    /// Create a new random ObjectUid.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw bytes, as written on the wire.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuild from wire bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for ObjectUid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a value needs to know about an object it references.
pub trait ObjectHandle: Send + Sync + 'static {
    /// Identity shared with all proxies of this object.
    fn uid(&self) -> ObjectUid;

    /// Callable surface of the object.
    fn meta_object(&self) -> &Arc<MetaObject>;

    /// Upcast used to recover the concrete object type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Shared, reference-counted object reference held by a value.
///
/// Cloning never copies the object; equality is identity (uid) equality.
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn ObjectHandle>);

impl ObjectRef {
    /// Wrap a handle.
    pub fn new(handle: Arc<dyn ObjectHandle>) -> Self {
        Self(handle)
    }

    /// Identity of the referenced object.
    pub fn uid(&self) -> ObjectUid {
        self.0.uid()
    }

    /// Callable surface of the referenced object.
    pub fn meta_object(&self) -> &Arc<MetaObject> {
        self.0.meta_object()
    }

    /// Recover the concrete handle type.
    pub fn downcast<T: ObjectHandle>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).into_any().downcast::<T>().ok()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.uid() == other.uid()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self.uid())
    }
}
