//! Binary value encoding.
//!
//! Values are written following their signature, little endian:
//! scalars at fixed width, `bool` as one byte, strings and raw buffers as
//! a `u32` length plus bytes, sequences as a `u32` count plus items,
//! mappings as a `u32` count plus key/value pairs, dynamic values as their
//! signature string followed by the value. Object references are written as
//! an [`ObjectDescriptor`]; the connection decides what goes in it through
//! the [`ReferenceExporter`] and [`ReferenceResolver`] seams.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_types::signature::MAX_NESTING;
use tether_types::{
    DynamicValue, EndpointId, Error, MetaObject, ObjectRef, ObjectUid, Result, Signature,
};

/// On-wire form of an object reference.
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    /// Endpoint that sent the descriptor.
    pub endpoint: EndpointId,
    /// Export id on the sending endpoint; calls are addressed to it.
    pub route: u64,
    /// Identity of the object.
    pub uid: ObjectUid,
    /// Present the first time `route` is sent on a connection.
    pub meta: Option<Arc<MetaObject>>,
}

/// Turns outgoing object references into descriptors.
pub trait ReferenceExporter {
    fn export(&mut self, object: &ObjectRef) -> Result<ObjectDescriptor>;
}

/// Turns incoming descriptors into object references.
pub trait ReferenceResolver {
    fn resolve(&mut self, descriptor: ObjectDescriptor) -> Result<ObjectRef>;
}

pub(crate) fn malformed(what: impl Into<String>) -> Error {
    Error::MalformedFrame(what.into())
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(malformed(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn take_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub(crate) fn take_u16(buf: &mut Bytes) -> Result<u16> {
    need(buf, 2, "u16")?;
    Ok(buf.get_u16_le())
}

pub(crate) fn take_u32(buf: &mut Bytes) -> Result<u32> {
    need(buf, 4, "u32")?;
    Ok(buf.get_u32_le())
}

pub(crate) fn take_u64(buf: &mut Bytes) -> Result<u64> {
    need(buf, 8, "u64")?;
    Ok(buf.get_u64_le())
}

pub(crate) fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    need(buf, len, "buffer")?;
    Ok(buf.split_to(len))
}

pub(crate) fn take_str(buf: &mut Bytes) -> Result<String> {
    let len = take_u32(buf)? as usize;
    let raw = take_bytes(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| malformed("string is not valid UTF-8"))
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn take_uuid(buf: &mut Bytes) -> Result<[u8; 16]> {
    need(buf, 16, "uuid")?;
    let mut out = [0u8; 16];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Write a descriptor; the meta object, when present, is MessagePack.
pub fn encode_descriptor(buf: &mut BytesMut, descriptor: &ObjectDescriptor) -> Result<()> {
    buf.put_slice(descriptor.endpoint.0.as_bytes());
    buf.put_u64_le(descriptor.route);
    buf.put_slice(descriptor.uid.as_bytes());
    match &descriptor.meta {
        Some(meta) => {
            let packed = rmp_serde::to_vec(meta.as_ref())
                .map_err(|e| Error::Remote(format!("cannot encode meta object: {e}")))?;
            buf.put_u8(1);
            buf.put_u32_le(packed.len() as u32);
            buf.put_slice(&packed);
        }
        None => buf.put_u8(0),
    }
    Ok(())
}

pub fn decode_descriptor(buf: &mut Bytes) -> Result<ObjectDescriptor> {
    let endpoint = EndpointId(uuid::Uuid::from_bytes(take_uuid(buf)?));
    let route = take_u64(buf)?;
    let uid = ObjectUid::from_bytes(take_uuid(buf)?);
    let meta = match take_u8(buf)? {
        0 => None,
        1 => {
            let len = take_u32(buf)? as usize;
            let packed = take_bytes(buf, len)?;
            let meta: MetaObject = rmp_serde::from_slice(&packed)
                .map_err(|e| malformed(format!("bad meta object: {e}")))?;
            Some(Arc::new(meta))
        }
        other => return Err(malformed(format!("bad meta flag {other}"))),
    };
    Ok(ObjectDescriptor {
        endpoint,
        route,
        uid,
        meta,
    })
}

/// Append `value` to `buf`.
pub fn encode_value(
    buf: &mut BytesMut,
    value: &DynamicValue,
    exporter: &mut dyn ReferenceExporter,
) -> Result<()> {
    match value {
        DynamicValue::Void => {}
        DynamicValue::Bool(v) => buf.put_u8(u8::from(*v)),
        DynamicValue::Int8(v) => buf.put_i8(*v),
        DynamicValue::UInt8(v) => buf.put_u8(*v),
        DynamicValue::Int16(v) => buf.put_i16_le(*v),
        DynamicValue::UInt16(v) => buf.put_u16_le(*v),
        DynamicValue::Int32(v) => buf.put_i32_le(*v),
        DynamicValue::UInt32(v) => buf.put_u32_le(*v),
        DynamicValue::Int64(v) => buf.put_i64_le(*v),
        DynamicValue::UInt64(v) => buf.put_u64_le(*v),
        DynamicValue::Float32(v) => buf.put_f32_le(*v),
        DynamicValue::Float64(v) => buf.put_f64_le(*v),
        DynamicValue::String(s) => put_str(buf, s),
        DynamicValue::Raw(raw) => {
            buf.put_u32_le(raw.len() as u32);
            buf.put_slice(raw);
        }
        DynamicValue::List { items, .. } => {
            buf.put_u32_le(items.len() as u32);
            for item in items {
                encode_value(buf, item, exporter)?;
            }
        }
        DynamicValue::Map { entries, .. } => {
            buf.put_u32_le(entries.len() as u32);
            for (key, item) in entries {
                put_str(buf, key);
                encode_value(buf, item, exporter)?;
            }
        }
        DynamicValue::Dynamic(inner) => {
            put_str(buf, &inner.signature().to_string());
            encode_value(buf, inner, exporter)?;
        }
        DynamicValue::Object(object) => {
            let descriptor = exporter.export(object)?;
            encode_descriptor(buf, &descriptor)?;
        }
        DynamicValue::Opaque { type_name, bytes } => {
            put_str(buf, type_name);
            buf.put_u32_le(bytes.len() as u32);
            buf.put_slice(bytes);
        }
    }
    Ok(())
}

/// Append every value of a tuple, without a count.
pub fn encode_values(
    buf: &mut BytesMut,
    values: &[DynamicValue],
    exporter: &mut dyn ReferenceExporter,
) -> Result<()> {
    for value in values {
        encode_value(buf, value, exporter)?;
    }
    Ok(())
}

/// Read one value of signature `sig`.
pub fn decode_value(
    buf: &mut Bytes,
    sig: &Signature,
    resolver: &mut dyn ReferenceResolver,
) -> Result<DynamicValue> {
    decode_nested(buf, sig, resolver, 0)
}

/// `depth` counts enclosing containers, dynamic wrappers included.
fn decode_nested(
    buf: &mut Bytes,
    sig: &Signature,
    resolver: &mut dyn ReferenceResolver,
    depth: usize,
) -> Result<DynamicValue> {
    if depth > MAX_NESTING {
        return Err(malformed(format!("value nested deeper than {MAX_NESTING} levels")));
    }
    Ok(match sig {
        Signature::Void => DynamicValue::Void,
        Signature::Bool => match take_u8(buf)? {
            0 => DynamicValue::Bool(false),
            1 => DynamicValue::Bool(true),
            other => return Err(malformed(format!("bad bool byte {other}"))),
        },
        Signature::Int8 => DynamicValue::Int8(take_u8(buf)? as i8),
        Signature::UInt8 => DynamicValue::UInt8(take_u8(buf)?),
        Signature::Int16 => DynamicValue::Int16(take_u16(buf)? as i16),
        Signature::UInt16 => DynamicValue::UInt16(take_u16(buf)?),
        Signature::Int32 => DynamicValue::Int32(take_u32(buf)? as i32),
        Signature::UInt32 => DynamicValue::UInt32(take_u32(buf)?),
        Signature::Int64 => DynamicValue::Int64(take_u64(buf)? as i64),
        Signature::UInt64 => DynamicValue::UInt64(take_u64(buf)?),
        Signature::Float32 => DynamicValue::Float32(f32::from_bits(take_u32(buf)?)),
        Signature::Float64 => DynamicValue::Float64(f64::from_bits(take_u64(buf)?)),
        Signature::String => DynamicValue::String(take_str(buf)?),
        Signature::Raw => {
            let len = take_u32(buf)? as usize;
            DynamicValue::Raw(take_bytes(buf, len)?)
        }
        Signature::List(element) => {
            let count = take_u32(buf)? as usize;
            if element.is_void() && count != 0 {
                return Err(malformed(format!("sequence of {count} void items")));
            }
            if count > buf.remaining() {
                return Err(malformed(format!("sequence count {count} exceeds frame")));
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_nested(buf, element, resolver, depth + 1)?);
            }
            DynamicValue::List {
                element: (**element).clone(),
                items,
            }
        }
        Signature::Map(value) => {
            let count = take_u32(buf)? as usize;
            if count > buf.remaining() {
                return Err(malformed(format!("mapping count {count} exceeds frame")));
            }
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let key = take_str(buf)?;
                let item = decode_nested(buf, value, resolver, depth + 1)?;
                if entries.insert(key, item).is_some() {
                    return Err(malformed("duplicate mapping key"));
                }
            }
            DynamicValue::Map {
                value: (**value).clone(),
                entries,
            }
        }
        Signature::Dynamic => {
            let text = take_str(buf)?;
            let inner_sig = Signature::parse(&text)
                .map_err(|_| malformed(format!("bad dynamic signature '{text}'")))?;
            if matches!(inner_sig, Signature::Dynamic | Signature::Tuple(_)) {
                return Err(malformed(format!("dynamic value cannot hold '{text}'")));
            }
            DynamicValue::Dynamic(Box::new(decode_nested(buf, &inner_sig, resolver, depth + 1)?))
        }
        Signature::Object => {
            let descriptor = decode_descriptor(buf)?;
            DynamicValue::Object(resolver.resolve(descriptor)?)
        }
        Signature::Opaque(name) => {
            let type_name = take_str(buf)?;
            if &type_name != name {
                return Err(malformed(format!(
                    "opaque type '{type_name}' where '{name}' was declared"
                )));
            }
            let len = take_u32(buf)? as usize;
            DynamicValue::Opaque {
                type_name,
                bytes: take_bytes(buf, len)?,
            }
        }
        Signature::Tuple(_) => return Err(malformed(format!("tuple {sig} is not a value"))),
    })
}

/// Read the members of a tuple signature.
pub fn decode_values(
    buf: &mut Bytes,
    tuple: &Signature,
    resolver: &mut dyn ReferenceResolver,
) -> Result<Vec<DynamicValue>> {
    tuple
        .children()
        .iter()
        .map(|sig| decode_value(buf, sig, resolver))
        .collect()
}

/// Fail when a decoded body left bytes behind.
pub fn expect_end(buf: &Bytes) -> Result<()> {
    if buf.has_remaining() {
        return Err(malformed(format!("{} trailing bytes", buf.remaining())));
    }
    Ok(())
}
