//! The undecorated original record and its pre-existing body codec.
//!
//! This codec is the fallback decode path for byte buffers produced by
//! systems that know nothing about decoration; its leading version word
//! never collides with the decorated frame magics.

use serde::{Deserialize, Serialize};

use crate::config::Limits;
use crate::payload::{decode_payload, encode_payload, Payload};
use crate::wire::{self, WireError};

use super::key::derive_key;

const RECORD_VERSION: u16 = 1;

/// Identity of a single device user, an opaque small value type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserHandle(i32);

impl UserHandle {
    pub fn new(identifier: i32) -> Self {
        Self(identifier)
    }

    pub fn identifier(self) -> i32 {
        self.0
    }
}

impl std::fmt::Debug for UserHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserHandle({})", self.0)
    }
}

impl std::fmt::Display for UserHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable identity fields of a notification record.
///
/// Never mutated after construction; decoration lives on the proxy only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub package: String,
    pub id: i32,
    pub tag: Option<String>,
    pub uid: u32,
    pub initial_pid: i32,
    pub score: i32,
    pub user: UserHandle,
    pub override_group_key: Option<String>,
    pub post_time_ms: i64,
}

impl RecordIdentity {
    /// The record's own canonical key, before any decoration.
    pub fn key(&self) -> String {
        derive_key(
            self.user,
            &self.package,
            self.id,
            self.tag.as_deref(),
            self.uid,
            self.override_group_key.as_deref(),
        )
    }
}

/// A plain notification record: identity plus resident payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationRecord {
    pub identity: RecordIdentity,
    pub payload: Payload,
}

impl NotificationRecord {
    pub fn encode_body(&self, limits: &Limits) -> Result<Vec<u8>, WireError> {
        let payload = encode_payload(&self.payload)?;
        if payload.len() > limits.max_payload_bytes {
            return Err(WireError::PayloadTooLarge {
                max_bytes: limits.max_payload_bytes,
                got_bytes: payload.len(),
            });
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        wire::write_string(&mut buf, &self.identity.package, limits)?;
        buf.extend_from_slice(&self.identity.id.to_le_bytes());
        wire::write_opt_string(&mut buf, self.identity.tag.as_deref(), limits)?;
        buf.extend_from_slice(&self.identity.uid.to_le_bytes());
        buf.extend_from_slice(&self.identity.user.identifier().to_le_bytes());
        wire::write_opt_string(&mut buf, self.identity.override_group_key.as_deref(), limits)?;
        buf.extend_from_slice(&self.identity.post_time_ms.to_le_bytes());
        buf.extend_from_slice(&self.identity.initial_pid.to_le_bytes());
        buf.extend_from_slice(&self.identity.score.to_le_bytes());
        let payload_len = u32::try_from(payload.len()).map_err(|_| WireError::MalformedFrame {
            reason: "payload length exceeds u32".to_string(),
        })?;
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn decode_body(bytes: &[u8], limits: &Limits) -> Result<Self, WireError> {
        let mut offset = 0usize;
        let version = wire::read_u16_le(bytes, &mut offset)?;
        if version != RECORD_VERSION {
            return Err(WireError::MalformedFrame {
                reason: format!("unsupported record version {version}"),
            });
        }
        let reserved = wire::read_u16_le(bytes, &mut offset)?;
        if reserved != 0 {
            return Err(WireError::MalformedFrame {
                reason: format!("record reserved field not zero ({reserved})"),
            });
        }

        let package = wire::read_string(bytes, &mut offset, limits)?;
        let id = wire::read_i32_le(bytes, &mut offset)?;
        let tag = wire::read_opt_string(bytes, &mut offset, limits)?;
        let uid = wire::read_u32_le(bytes, &mut offset)?;
        let user = UserHandle::new(wire::read_i32_le(bytes, &mut offset)?);
        let override_group_key = wire::read_opt_string(bytes, &mut offset, limits)?;
        let post_time_ms = wire::read_i64_le(bytes, &mut offset)?;
        let initial_pid = wire::read_i32_le(bytes, &mut offset)?;
        let score = wire::read_i32_le(bytes, &mut offset)?;

        let payload_len = wire::read_u32_le(bytes, &mut offset)? as usize;
        if payload_len > limits.max_payload_bytes {
            return Err(WireError::PayloadTooLarge {
                max_bytes: limits.max_payload_bytes,
                got_bytes: payload_len,
            });
        }
        let payload_bytes = wire::take(bytes, &mut offset, payload_len)?;
        let payload = decode_payload(payload_bytes, limits)?;

        if offset != bytes.len() {
            return Err(WireError::TrailingBytes);
        }

        Ok(Self {
            identity: RecordIdentity {
                package,
                id,
                tag,
                uid,
                initial_pid,
                score,
                user,
                override_group_key,
                post_time_ms,
            },
            payload,
        })
    }
}
