//! Binary frames exchanged after the handshake.
//!
//! Every frame body starts with `kind: u8` and `correlation id: u64 LE`
//! (0 for events). Argument, return and event payloads stay as raw bytes
//! here: only the connection knows the signatures to decode them with.

use crate::codec::{expect_end, malformed, put_str, take_str, take_u16, take_u32, take_u64, take_u8};
use bytes::{BufMut, Bytes, BytesMut};
use tether_types::Result;

/// Correlation id linking a request to its answer on one connection.
pub type CorrelationId = u64;

/// Frame kinds as written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Call = 1,
    Reply = 2,
    Error = 3,
    Event = 4,
    Lookup = 5,
    LookupReply = 6,
    Cancel = 7,
    Canceled = 8,
    ListServices = 9,
    ServiceList = 10,
}

impl FrameKind {
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => Self::Call,
            2 => Self::Reply,
            3 => Self::Error,
            4 => Self::Event,
            5 => Self::Lookup,
            6 => Self::LookupReply,
            7 => Self::Cancel,
            8 => Self::Canceled,
            9 => Self::ListServices,
            10 => Self::ServiceList,
            other => return Err(malformed(format!("unknown frame kind {other}"))),
        })
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call {
        corr: CorrelationId,
        object: u64,
        action: u32,
        argc: u32,
        args: Bytes,
    },
    Reply {
        corr: CorrelationId,
        payload: Bytes,
    },
    Error {
        corr: CorrelationId,
        code: u16,
        message: String,
    },
    Event {
        object: u64,
        signal: u32,
        argc: u32,
        payload: Bytes,
    },
    Lookup {
        corr: CorrelationId,
        name: String,
    },
    LookupReply {
        corr: CorrelationId,
        descriptor: Bytes,
    },
    Cancel {
        corr: CorrelationId,
    },
    Canceled {
        corr: CorrelationId,
    },
    ListServices {
        corr: CorrelationId,
    },
    ServiceList {
        corr: CorrelationId,
        names: Vec<String>,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Call { .. } => FrameKind::Call,
            Self::Reply { .. } => FrameKind::Reply,
            Self::Error { .. } => FrameKind::Error,
            Self::Event { .. } => FrameKind::Event,
            Self::Lookup { .. } => FrameKind::Lookup,
            Self::LookupReply { .. } => FrameKind::LookupReply,
            Self::Cancel { .. } => FrameKind::Cancel,
            Self::Canceled { .. } => FrameKind::Canceled,
            Self::ListServices { .. } => FrameKind::ListServices,
            Self::ServiceList { .. } => FrameKind::ServiceList,
        }
    }

    /// Correlation id; 0 for events.
    pub fn corr(&self) -> CorrelationId {
        match self {
            Self::Event { .. } => 0,
            Self::Call { corr, .. }
            | Self::Reply { corr, .. }
            | Self::Error { corr, .. }
            | Self::Lookup { corr, .. }
            | Self::LookupReply { corr, .. }
            | Self::Cancel { corr }
            | Self::Canceled { corr }
            | Self::ListServices { corr }
            | Self::ServiceList { corr, .. } => *corr,
        }
    }

    /// Encode the frame body (without the length header).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.kind() as u8);
        buf.put_u64_le(self.corr());
        match self {
            Self::Call {
                object,
                action,
                argc,
                args,
                ..
            } => {
                buf.put_u64_le(*object);
                buf.put_u32_le(*action);
                buf.put_u32_le(*argc);
                buf.put_slice(args);
            }
            Self::Reply { payload, .. } => buf.put_slice(payload),
            Self::Error { code, message, .. } => {
                buf.put_u16_le(*code);
                put_str(&mut buf, message);
            }
            Self::Event {
                object,
                signal,
                argc,
                payload,
            } => {
                buf.put_u64_le(*object);
                buf.put_u32_le(*signal);
                buf.put_u32_le(*argc);
                buf.put_slice(payload);
            }
            Self::Lookup { name, .. } => put_str(&mut buf, name),
            Self::LookupReply { descriptor, .. } => buf.put_slice(descriptor),
            Self::Cancel { .. } | Self::Canceled { .. } | Self::ListServices { .. } => {}
            Self::ServiceList { names, .. } => {
                buf.put_u32_le(names.len() as u32);
                for name in names {
                    put_str(&mut buf, name);
                }
            }
        }
        buf.freeze()
    }

    /// Decode a frame body. Variable payloads keep the rest of the body.
    pub fn decode(mut body: Bytes) -> Result<Self> {
        let kind = FrameKind::from_code(take_u8(&mut body)?)?;
        let corr = take_u64(&mut body)?;
        let frame = match kind {
            FrameKind::Call => Self::Call {
                corr,
                object: take_u64(&mut body)?,
                action: take_u32(&mut body)?,
                argc: take_u32(&mut body)?,
                args: std::mem::take(&mut body),
            },
            FrameKind::Reply => Self::Reply {
                corr,
                payload: std::mem::take(&mut body),
            },
            FrameKind::Error => Self::Error {
                corr,
                code: take_u16(&mut body)?,
                message: take_str(&mut body)?,
            },
            FrameKind::Event => {
                if corr != 0 {
                    return Err(malformed(format!("event with correlation id {corr}")));
                }
                Self::Event {
                    object: take_u64(&mut body)?,
                    signal: take_u32(&mut body)?,
                    argc: take_u32(&mut body)?,
                    payload: std::mem::take(&mut body),
                }
            }
            FrameKind::Lookup => Self::Lookup {
                corr,
                name: take_str(&mut body)?,
            },
            FrameKind::LookupReply => Self::LookupReply {
                corr,
                descriptor: std::mem::take(&mut body),
            },
            FrameKind::Cancel => Self::Cancel { corr },
            FrameKind::Canceled => Self::Canceled { corr },
            FrameKind::ListServices => Self::ListServices { corr },
            FrameKind::ServiceList => {
                let count = take_u32(&mut body)? as usize;
                if count > body.len() {
                    return Err(malformed(format!("service count {count} exceeds frame")));
                }
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    names.push(take_str(&mut body)?);
                }
                Self::ServiceList { corr, names }
            }
        };
        expect_end(&body)?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::Error;

    #[test]
    fn test_header_layout() {
        let bytes = Frame::Cancel { corr: 0x0102 }.encode();
        assert_eq!(&bytes[..], &[7, 2, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_call_keeps_raw_args() {
        let frame = Frame::Call {
            corr: 9,
            object: 3,
            action: 100,
            argc: 1,
            args: Bytes::from_static(&[42, 0, 0, 0]),
        };
        assert_eq!(Frame::decode(frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_service_list() {
        let frame = Frame::ServiceList {
            corr: 4,
            names: vec!["PingPongService".into(), "Perf".into()],
        };
        assert_eq!(Frame::decode(frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_garbage_is_malformed() {
        for body in [
            &[][..],
            &[99, 0, 0, 0, 0, 0, 0, 0, 0][..],
            &[1, 1, 0][..],
            &[7, 1, 0, 0, 0, 0, 0, 0, 0, 0xff][..],
            &[4, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0][..],
        ] {
            assert!(
                matches!(
                    Frame::decode(Bytes::copy_from_slice(body)),
                    Err(Error::MalformedFrame(_))
                ),
                "{body:?} should be rejected"
            );
        }
    }
}
