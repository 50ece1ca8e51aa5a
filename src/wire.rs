//! Dual-mode wire codec (magic dispatch, full and incremental-reply frames).
//!
//! A full frame carries the original identity, the payload (inline bytes or
//! a transferable capability token), and the decoration block. A reply frame
//! carries the decoration block only and assumes the receiver holds a full
//! copy to patch. Anything else is assumed to be a plain record produced by
//! a system unaware of decoration and is decoded with the original codec.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::config::Limits;
use crate::error::{Effect, Transience};
use crate::payload::{
    decode_payload, encode_payload, LocalPayload, PayloadDecodeError, PayloadEncodeError,
    PayloadError, PayloadSource, PayloadToken, PayloadTransport, RemotePayload,
};
use crate::record::decorated::{DecoratedRecord, TagOverride};
use crate::record::plain::{NotificationRecord, RecordIdentity, UserHandle};

const MAGIC_FULL: u32 = 0x4E44_4631; // "NDF1"
const MAGIC_REPLY: u32 = 0x4E44_5231; // "NDR1"

const PAYLOAD_CAPABILITY: u8 = 0x00;
const PAYLOAD_INLINE: u8 = 0x01;

/// Decoration block shared by both frame shapes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decoration {
    pub id_override: Option<i32>,
    pub tag_override: TagOverride,
}

/// Payload position in a full frame: inline body bytes when the record is
/// dirty or local, else the capability token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadRef {
    Inline(Bytes),
    Capability(PayloadToken),
}

/// A decoded wire frame. The magic value is the discriminant, handled here
/// and nowhere else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Full {
        identity: RecordIdentity,
        payload: PayloadRef,
        decoration: Decoration,
    },
    Reply {
        decoration: Decoration,
    },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WireError {
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },
    #[error("frame too large: {got_bytes} exceeds {max_bytes}")]
    FrameTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("payload blob too large: {got_bytes} exceeds {max_bytes}")]
    PayloadTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("string field too large: {got_bytes} exceeds {max_bytes}")]
    StringTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("trailing bytes after frame")]
    TrailingBytes,
    #[error("remote payload source carries no transferable token")]
    MissingToken,
    #[error("payload body encode: {0}")]
    PayloadEncode(#[from] PayloadEncodeError),
    #[error("payload body decode: {0}")]
    PayloadDecode(#[from] PayloadDecodeError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl WireError {
    pub fn transience(&self) -> Transience {
        // A rejected frame stays rejected; payload access failures are the
        // capability's own non-retryable kind.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

// =============================================================================
// Encode
// =============================================================================

/// Encode a record for transfer: the incremental-reply frame when the record
/// is marked for reply write-back, else the full frame.
pub fn encode_record(record: &DecoratedRecord, limits: &Limits) -> Result<Vec<u8>, WireError> {
    let decoration = Decoration {
        id_override: record.id_override(),
        tag_override: record.tag_override().clone(),
    };
    let frame = if record.reply_marked() {
        Frame::Reply { decoration }
    } else {
        Frame::Full {
            identity: record.identity().clone(),
            payload: payload_ref(record)?,
            decoration,
        }
    };
    encode_frame(&frame, limits)
}

// A fetched payload cache is dirty and must be re-encoded; a local payload
// is resident and cheap to inline. Only a clean remote payload travels as a
// capability token.
fn payload_ref(record: &DecoratedRecord) -> Result<PayloadRef, WireError> {
    if let Some(payload) = record.fetched_payload() {
        return Ok(PayloadRef::Inline(Bytes::from(encode_payload(payload)?)));
    }
    let source = record.payload_source();
    if source.is_local() {
        let payload = source.payload()?;
        return Ok(PayloadRef::Inline(Bytes::from(encode_payload(&payload)?)));
    }
    source
        .token()
        .map(PayloadRef::Capability)
        .ok_or(WireError::MissingToken)
}

pub fn encode_frame(frame: &Frame, limits: &Limits) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    match frame {
        Frame::Full {
            identity,
            payload,
            decoration,
        } => {
            buf.extend_from_slice(&MAGIC_FULL.to_le_bytes());
            write_string(&mut buf, &identity.package, limits)?;
            buf.extend_from_slice(&identity.id.to_le_bytes());
            write_opt_string(&mut buf, identity.tag.as_deref(), limits)?;
            buf.extend_from_slice(&identity.uid.to_le_bytes());
            buf.extend_from_slice(&identity.user.identifier().to_le_bytes());
            write_opt_string(&mut buf, identity.override_group_key.as_deref(), limits)?;
            buf.extend_from_slice(&identity.post_time_ms.to_le_bytes());
            match payload {
                PayloadRef::Inline(blob) => {
                    if blob.len() > limits.max_payload_bytes {
                        return Err(WireError::PayloadTooLarge {
                            max_bytes: limits.max_payload_bytes,
                            got_bytes: blob.len(),
                        });
                    }
                    let len =
                        u32::try_from(blob.len()).map_err(|_| WireError::MalformedFrame {
                            reason: "payload length exceeds u32".to_string(),
                        })?;
                    buf.push(PAYLOAD_INLINE);
                    buf.extend_from_slice(&len.to_le_bytes());
                    buf.extend_from_slice(blob);
                }
                PayloadRef::Capability(token) => {
                    buf.push(PAYLOAD_CAPABILITY);
                    buf.extend_from_slice(token.as_bytes());
                }
            }
            write_decoration(&mut buf, decoration, limits)?;
        }
        Frame::Reply { decoration } => {
            buf.extend_from_slice(&MAGIC_REPLY.to_le_bytes());
            write_decoration(&mut buf, decoration, limits)?;
        }
    }
    if buf.len() > limits.max_frame_bytes {
        return Err(WireError::FrameTooLarge {
            max_bytes: limits.max_frame_bytes,
            got_bytes: buf.len(),
        });
    }
    Ok(buf)
}

fn write_decoration(
    buf: &mut Vec<u8>,
    decoration: &Decoration,
    limits: &Limits,
) -> Result<(), WireError> {
    match decoration.id_override {
        Some(id) => {
            buf.push(1);
            buf.extend_from_slice(&id.to_le_bytes());
        }
        None => buf.push(0),
    }
    match &decoration.tag_override {
        TagOverride::Original => buf.push(0),
        TagOverride::Overridden(tag) => {
            buf.push(1);
            write_opt_string(buf, tag.as_deref(), limits)?;
        }
    }
    Ok(())
}

// =============================================================================
// Decode
// =============================================================================

/// Decode a transfer buffer into a fresh record.
///
/// Dispatch on the leading magic value: a full frame reconstructs the record
/// (binding an inline payload as a local capability, or a token against
/// `transport`); a reply frame is rejected, since patching requires a base
/// instance (see [`apply_reply`]); anything else is decoded as a plain
/// record with decoration left at its defaults and the payload resident.
pub fn decode_record(
    bytes: &[u8],
    transport: &Arc<dyn PayloadTransport>,
    limits: &Limits,
) -> Result<DecoratedRecord, WireError> {
    if bytes.len() > limits.max_frame_bytes {
        return Err(WireError::FrameTooLarge {
            max_bytes: limits.max_frame_bytes,
            got_bytes: bytes.len(),
        });
    }
    match peek_magic(bytes) {
        Some(MAGIC_FULL) => {
            let (identity, payload, decoration) = decode_full_parts(&bytes[4..], limits)?;
            let source: Arc<dyn PayloadSource> = match payload {
                PayloadRef::Inline(blob) => {
                    Arc::new(LocalPayload::new(decode_payload(&blob, limits)?))
                }
                PayloadRef::Capability(token) => {
                    Arc::new(RemotePayload::new(token, Arc::clone(transport)))
                }
            };
            Ok(DecoratedRecord::from_wire(
                identity,
                source,
                decoration.id_override,
                decoration.tag_override,
            ))
        }
        Some(MAGIC_REPLY) => Err(WireError::MalformedFrame {
            reason: "incremental reply frame without a base instance".to_string(),
        }),
        _ => {
            let record = NotificationRecord::decode_body(bytes, limits)?;
            Ok(DecoratedRecord::from_record(record))
        }
    }
}

/// Decode a single frame without binding it to a record.
pub fn decode_frame(bytes: &[u8], limits: &Limits) -> Result<Frame, WireError> {
    let mut offset = 0usize;
    let magic = read_u32_le(bytes, &mut offset)?;
    match magic {
        MAGIC_FULL => {
            let (identity, payload, decoration) = decode_full_parts(&bytes[4..], limits)?;
            Ok(Frame::Full {
                identity,
                payload,
                decoration,
            })
        }
        MAGIC_REPLY => {
            let decoration = read_decoration(bytes, &mut offset, limits)?;
            if offset != bytes.len() {
                return Err(WireError::TrailingBytes);
            }
            Ok(Frame::Reply { decoration })
        }
        other => Err(WireError::MalformedFrame {
            reason: format!("unknown frame magic {other:#010x}"),
        }),
    }
}

/// Patch a previously-decoded full instance with an incremental-reply frame.
///
/// The target is not mutated before the frame is fully validated. Decoration
/// is bound leniently, matching the decode path.
pub fn apply_reply(
    record: &mut DecoratedRecord,
    bytes: &[u8],
    limits: &Limits,
) -> Result<(), WireError> {
    let mut offset = 0usize;
    let magic = read_u32_le(bytes, &mut offset)?;
    if magic != MAGIC_REPLY {
        return Err(WireError::MalformedFrame {
            reason: format!("expected reply magic, got {magic:#010x}"),
        });
    }
    let decoration = read_decoration(bytes, &mut offset, limits)?;
    if offset != bytes.len() {
        return Err(WireError::TrailingBytes);
    }
    record.bind_decoration(decoration.id_override, decoration.tag_override);
    Ok(())
}

fn peek_magic(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

// Initial pid and score are not transmitted; the receiver reconstructs them
// as zero.
fn decode_full_parts(
    bytes: &[u8],
    limits: &Limits,
) -> Result<(RecordIdentity, PayloadRef, Decoration), WireError> {
    let mut offset = 0usize;
    let package = read_string(bytes, &mut offset, limits)?;
    let id = read_i32_le(bytes, &mut offset)?;
    let tag = read_opt_string(bytes, &mut offset, limits)?;
    let uid = read_u32_le(bytes, &mut offset)?;
    let user = UserHandle::new(read_i32_le(bytes, &mut offset)?);
    let override_group_key = read_opt_string(bytes, &mut offset, limits)?;
    let post_time_ms = read_i64_le(bytes, &mut offset)?;

    let payload = match read_u8(bytes, &mut offset)? {
        PAYLOAD_CAPABILITY => {
            PayloadRef::Capability(PayloadToken::from_bytes(read_array::<16>(bytes, &mut offset)?))
        }
        PAYLOAD_INLINE => {
            let len = read_u32_le(bytes, &mut offset)? as usize;
            if len > limits.max_payload_bytes {
                return Err(WireError::PayloadTooLarge {
                    max_bytes: limits.max_payload_bytes,
                    got_bytes: len,
                });
            }
            let blob = take(bytes, &mut offset, len)?;
            PayloadRef::Inline(Bytes::copy_from_slice(blob))
        }
        other => {
            return Err(WireError::MalformedFrame {
                reason: format!("unknown payload discriminant {other:#04x}"),
            })
        }
    };

    let decoration = read_decoration(bytes, &mut offset, limits)?;
    if offset != bytes.len() {
        return Err(WireError::TrailingBytes);
    }

    Ok((
        RecordIdentity {
            package,
            id,
            tag,
            uid,
            initial_pid: 0,
            score: 0,
            user,
            override_group_key,
            post_time_ms,
        },
        payload,
        decoration,
    ))
}

fn read_decoration(
    bytes: &[u8],
    offset: &mut usize,
    limits: &Limits,
) -> Result<Decoration, WireError> {
    let id_override = match read_u8(bytes, offset)? {
        0 => None,
        1 => Some(read_i32_le(bytes, offset)?),
        other => {
            return Err(WireError::MalformedFrame {
                reason: format!("invalid id override presence byte {other:#04x}"),
            })
        }
    };
    let tag_override = match read_u8(bytes, offset)? {
        0 => TagOverride::Original,
        1 => TagOverride::Overridden(read_opt_string(bytes, offset, limits)?),
        other => {
            return Err(WireError::MalformedFrame {
                reason: format!("invalid tag override presence byte {other:#04x}"),
            })
        }
    };
    Ok(Decoration {
        id_override,
        tag_override,
    })
}

// =============================================================================
// Byte helpers (shared with the plain record codec)
// =============================================================================

pub(crate) fn write_string(buf: &mut Vec<u8>, s: &str, limits: &Limits) -> Result<(), WireError> {
    if s.len() > limits.max_string_bytes {
        return Err(WireError::StringTooLarge {
            max_bytes: limits.max_string_bytes,
            got_bytes: s.len(),
        });
    }
    let len = u32::try_from(s.len()).map_err(|_| WireError::MalformedFrame {
        reason: "string length exceeds u32".to_string(),
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn write_opt_string(
    buf: &mut Vec<u8>,
    s: Option<&str>,
    limits: &Limits,
) -> Result<(), WireError> {
    match s {
        Some(s) => {
            buf.push(1);
            write_string(buf, s, limits)
        }
        None => {
            buf.push(0);
            Ok(())
        }
    }
}

pub(crate) fn read_u8(bytes: &[u8], offset: &mut usize) -> Result<u8, WireError> {
    Ok(take(bytes, offset, 1)?[0])
}

pub(crate) fn read_u16_le(bytes: &[u8], offset: &mut usize) -> Result<u16, WireError> {
    let slice = take(bytes, offset, 2)?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_u32_le(bytes: &[u8], offset: &mut usize) -> Result<u32, WireError> {
    let slice = take(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

pub(crate) fn read_i32_le(bytes: &[u8], offset: &mut usize) -> Result<i32, WireError> {
    let slice = take(bytes, offset, 4)?;
    Ok(i32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

pub(crate) fn read_i64_le(bytes: &[u8], offset: &mut usize) -> Result<i64, WireError> {
    let slice = take(bytes, offset, 8)?;
    Ok(i64::from_le_bytes([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ]))
}

pub(crate) fn read_array<const N: usize>(
    bytes: &[u8],
    offset: &mut usize,
) -> Result<[u8; N], WireError> {
    let slice = take(bytes, offset, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

pub(crate) fn read_string(
    bytes: &[u8],
    offset: &mut usize,
    limits: &Limits,
) -> Result<String, WireError> {
    let len = read_u32_le(bytes, offset)? as usize;
    if len > limits.max_string_bytes {
        return Err(WireError::StringTooLarge {
            max_bytes: limits.max_string_bytes,
            got_bytes: len,
        });
    }
    let slice = take(bytes, offset, len)?;
    let s = std::str::from_utf8(slice).map_err(|_| WireError::MalformedFrame {
        reason: "string field not valid UTF-8".to_string(),
    })?;
    Ok(s.to_string())
}

pub(crate) fn read_opt_string(
    bytes: &[u8],
    offset: &mut usize,
    limits: &Limits,
) -> Result<Option<String>, WireError> {
    match read_u8(bytes, offset)? {
        0 => Ok(None),
        1 => Ok(Some(read_string(bytes, offset, limits)?)),
        other => Err(WireError::MalformedFrame {
            reason: format!("invalid presence byte {other:#04x}"),
        }),
    }
}

pub(crate) fn take<'a>(
    bytes: &'a [u8],
    offset: &mut usize,
    len: usize,
) -> Result<&'a [u8], WireError> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| WireError::MalformedFrame {
            reason: "frame length overflow".to_string(),
        })?;
    if end > bytes.len() {
        return Err(WireError::MalformedFrame {
            reason: "frame truncated".to_string(),
        });
    }
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Full { identity, .. } => write!(f, "Full({})", identity.key()),
            Frame::Reply { .. } => write!(f, "Reply"),
        }
    }
}
