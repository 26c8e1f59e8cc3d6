//! Dynamic values: the type-erased unit of data interchange.
//!
//! A [`DynamicValue`] holds exactly one value of any supported shape and
//! always reports the [`Signature`] of that shape. Conversions to and from
//! native Rust types are exact: extracting an `i32` from an `Int64`, or an
//! `f32` from a `Float64`, fails with [`Error::TypeMismatch`] instead of
//! truncating.

use crate::error::{Error, Result};
use crate::object::ObjectRef;
use crate::signature::Signature;
use bytes::Bytes;
use std::collections::BTreeMap;

/// A value of any registered shape.
///
/// Cloning deep-copies scalars, strings, sequences and mappings; object
/// references are shared, never copied.
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicValue {
    Void,
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Raw(Bytes),
    /// Homogeneous sequence; `element` types empty sequences too.
    List {
        element: Signature,
        items: Vec<DynamicValue>,
    },
    /// String-keyed mapping, ordered by key.
    Map {
        value: Signature,
        entries: BTreeMap<String, DynamicValue>,
    },
    /// A value that carries its own signature (`m`).
    Dynamic(Box<DynamicValue>),
    Object(ObjectRef),
    /// Escape hatch for external types this layer does not interpret.
    Opaque {
        type_name: String,
        bytes: Bytes,
    },
}

impl DynamicValue {
    /// Construct from any native type with a known signature.
    pub fn from_native<T: IntoValue>(native: T) -> Self {
        native.into_value()
    }

    /// Wrap a value so it travels with its own signature.
    pub fn dynamic(value: DynamicValue) -> Self {
        match value {
            already @ DynamicValue::Dynamic(_) => already,
            other => DynamicValue::Dynamic(Box::new(other)),
        }
    }

    /// Build a sequence, checking every item against `element`.
    pub fn list(element: Signature, items: Vec<DynamicValue>) -> Result<Self> {
        let items = items
            .into_iter()
            .map(|item| item.coerce(&element))
            .collect::<Result<Vec<_>>>()?;
        Ok(DynamicValue::List { element, items })
    }

    /// Build a mapping, checking every value against `value`.
    pub fn map(value: Signature, entries: BTreeMap<String, DynamicValue>) -> Result<Self> {
        let entries = entries
            .into_iter()
            .map(|(k, v)| v.coerce(&value).map(|v| (k, v)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(DynamicValue::Map { value, entries })
    }

    /// Signature of the active variant.
    pub fn signature(&self) -> Signature {
        match self {
            Self::Void => Signature::Void,
            Self::Bool(_) => Signature::Bool,
            Self::Int8(_) => Signature::Int8,
            Self::UInt8(_) => Signature::UInt8,
            Self::Int16(_) => Signature::Int16,
            Self::UInt16(_) => Signature::UInt16,
            Self::Int32(_) => Signature::Int32,
            Self::UInt32(_) => Signature::UInt32,
            Self::Int64(_) => Signature::Int64,
            Self::UInt64(_) => Signature::UInt64,
            Self::Float32(_) => Signature::Float32,
            Self::Float64(_) => Signature::Float64,
            Self::String(_) => Signature::String,
            Self::Raw(_) => Signature::Raw,
            Self::List { element, .. } => Signature::list(element.clone()),
            Self::Map { value, .. } => Signature::map(value.clone()),
            Self::Dynamic(_) => Signature::Dynamic,
            Self::Object(_) => Signature::Object,
            Self::Opaque { type_name, .. } => Signature::Opaque(type_name.clone()),
        }
    }

    /// Reshape this value to `target` without changing its content.
    ///
    /// The only adjustments are wrapping into, or unwrapping out of, a
    /// dynamic (`m`) envelope. Anything else must match exactly.
    pub fn coerce(self, target: &Signature) -> Result<Self> {
        match (self, target) {
            (value, Signature::Dynamic) => Ok(Self::dynamic(value)),
            (Self::Dynamic(inner), target) => inner.coerce(target),
            (value, target) => {
                let found = value.signature();
                if &found == target {
                    Ok(value)
                } else {
                    Err(Error::type_mismatch(target, found))
                }
            }
        }
    }

    /// Extract a native value; fails on any signature difference.
    pub fn extract<T: FromValue>(&self) -> Result<T> {
        T::from_value(self.clone())
    }

    /// Consuming form of [`DynamicValue::extract`].
    pub fn into_native<T: FromValue>(self) -> Result<T> {
        T::from_value(self)
    }

    /// The content of a dynamic envelope, or the value itself.
    pub fn content(&self) -> &DynamicValue {
        match self {
            Self::Dynamic(inner) => inner.content(),
            other => other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.content() {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self.content() {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Every object reference reachable from this value.
    pub fn objects(&self) -> Vec<ObjectRef> {
        let mut out = Vec::new();
        self.collect_objects(&mut out);
        out
    }

    fn collect_objects(&self, out: &mut Vec<ObjectRef>) {
        match self {
            Self::Object(o) => out.push(o.clone()),
            Self::Dynamic(inner) => inner.collect_objects(out),
            Self::List { items, .. } => items.iter().for_each(|i| i.collect_objects(out)),
            Self::Map { entries, .. } => entries.values().for_each(|v| v.collect_objects(out)),
            _ => {}
        }
    }
}

/// Native types with a fixed signature.
pub trait Reflect {
    fn signature() -> Signature;
}

/// Native types that can be packed into a [`DynamicValue`].
pub trait IntoValue: Reflect {
    fn into_value(self) -> DynamicValue;
}

/// Native types that can be extracted from a [`DynamicValue`].
pub trait FromValue: Reflect + Sized {
    fn from_value(value: DynamicValue) -> Result<Self>;
}

macro_rules! scalar_value {
    ($($ty:ty => $variant:ident, $sig:ident;)*) => {
        $(
            impl Reflect for $ty {
                fn signature() -> Signature {
                    Signature::$sig
                }
            }

            impl IntoValue for $ty {
                fn into_value(self) -> DynamicValue {
                    DynamicValue::$variant(self)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: DynamicValue) -> Result<Self> {
                    match value {
                        DynamicValue::$variant(v) => Ok(v),
                        DynamicValue::Dynamic(inner) => Self::from_value(*inner),
                        other => Err(Error::type_mismatch(Signature::$sig, other.signature())),
                    }
                }
            }

            impl From<$ty> for DynamicValue {
                fn from(v: $ty) -> Self {
                    DynamicValue::$variant(v)
                }
            }
        )*
    };
}

scalar_value! {
    bool => Bool, Bool;
    i8 => Int8, Int8;
    u8 => UInt8, UInt8;
    i16 => Int16, Int16;
    u16 => UInt16, UInt16;
    i32 => Int32, Int32;
    u32 => UInt32, UInt32;
    i64 => Int64, Int64;
    u64 => UInt64, UInt64;
    f32 => Float32, Float32;
    f64 => Float64, Float64;
    String => String, String;
    Bytes => Raw, Raw;
}

impl From<&str> for DynamicValue {
    fn from(v: &str) -> Self {
        DynamicValue::String(v.to_string())
    }
}

impl Reflect for &str {
    fn signature() -> Signature {
        Signature::String
    }
}

impl IntoValue for &str {
    fn into_value(self) -> DynamicValue {
        DynamicValue::String(self.to_string())
    }
}

impl Reflect for () {
    fn signature() -> Signature {
        Signature::Void
    }
}

impl IntoValue for () {
    fn into_value(self) -> DynamicValue {
        DynamicValue::Void
    }
}

impl FromValue for () {
    fn from_value(value: DynamicValue) -> Result<Self> {
        match value.content() {
            DynamicValue::Void => Ok(()),
            other => Err(Error::type_mismatch(Signature::Void, other.signature())),
        }
    }
}

impl Reflect for DynamicValue {
    fn signature() -> Signature {
        Signature::Dynamic
    }
}

impl IntoValue for DynamicValue {
    fn into_value(self) -> DynamicValue {
        DynamicValue::dynamic(self)
    }
}

impl FromValue for DynamicValue {
    fn from_value(value: DynamicValue) -> Result<Self> {
        match value {
            DynamicValue::Dynamic(inner) => Ok(*inner),
            other => Ok(other),
        }
    }
}

impl Reflect for ObjectRef {
    fn signature() -> Signature {
        Signature::Object
    }
}

impl IntoValue for ObjectRef {
    fn into_value(self) -> DynamicValue {
        DynamicValue::Object(self)
    }
}

impl FromValue for ObjectRef {
    fn from_value(value: DynamicValue) -> Result<Self> {
        match value {
            DynamicValue::Object(o) => Ok(o),
            DynamicValue::Dynamic(inner) => Self::from_value(*inner),
            other => Err(Error::type_mismatch(Signature::Object, other.signature())),
        }
    }
}

impl<T: Reflect> Reflect for Vec<T> {
    fn signature() -> Signature {
        Signature::list(T::signature())
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> DynamicValue {
        DynamicValue::List {
            element: T::signature(),
            items: self.into_iter().map(IntoValue::into_value).collect(),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: DynamicValue) -> Result<Self> {
        match value {
            DynamicValue::List { element, items } if element == T::signature() => {
                items.into_iter().map(T::from_value).collect()
            }
            DynamicValue::Dynamic(inner) => Self::from_value(*inner),
            other => Err(Error::type_mismatch(Self::signature(), other.signature())),
        }
    }
}

impl<T: Reflect> Reflect for BTreeMap<String, T> {
    fn signature() -> Signature {
        Signature::map(T::signature())
    }
}

impl<T: IntoValue> IntoValue for BTreeMap<String, T> {
    fn into_value(self) -> DynamicValue {
        DynamicValue::Map {
            value: T::signature(),
            entries: self.into_iter().map(|(k, v)| (k, v.into_value())).collect(),
        }
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: DynamicValue) -> Result<Self> {
        match value {
            DynamicValue::Map { value, entries } if value == T::signature() => entries
                .into_iter()
                .map(|(k, v)| T::from_value(v).map(|v| (k, v)))
                .collect(),
            DynamicValue::Dynamic(inner) => Self::from_value(*inner),
            other => Err(Error::type_mismatch(Self::signature(), other.signature())),
        }
    }
}
