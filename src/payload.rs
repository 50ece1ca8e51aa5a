//! Notification payload: the heavy body behind a record, and the capability
//! used to reach it.
//!
//! A payload is either resident in-process (local, zero-cost reads) or lives
//! behind a remote capability that requires a blocking round-trip. The
//! `PayloadSource` trait hides the duality; the two adapters are selected at
//! construction time, never branched on ad hoc.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use minicbor::{Decoder, Encoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Limits;
use crate::error::{Effect, Transience};

/// Payload flag bits (host framework values, fixed contract).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadFlags(u32);

impl PayloadFlags {
    /// The notification is an ongoing event and cannot be dismissed.
    pub const ONGOING: PayloadFlags = PayloadFlags(1 << 1);
    /// The notification resists clearing even when not ongoing.
    pub const NO_CLEAR: PayloadFlags = PayloadFlags(1 << 5);

    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: PayloadFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_ongoing(self) -> bool {
        self.contains(Self::ONGOING)
    }

    pub fn is_clearable(self) -> bool {
        self.0 & (Self::ONGOING.0 | Self::NO_CLEAR.0) == 0
    }
}

/// The notification body.
///
/// Deliberately small: flags and timing drive proxy behavior, title/text and
/// the extras map stand in for the rest of the renderable content.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub flags: PayloadFlags,
    pub when_ms: i64,
    pub title: Option<String>,
    pub text: Option<String>,
    pub extras: BTreeMap<String, String>,
}

/// Transferable reference to a remote payload.
///
/// The token is what crosses the wire in place of payload bytes; the
/// receiving side binds it to its own transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadToken(Uuid);

impl PayloadToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for PayloadToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PayloadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadToken({})", self.0)
    }
}

impl fmt::Display for PayloadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Transport failure reported by an external `PayloadTransport`.
#[derive(Debug, Error, Clone)]
#[error("transport: {reason}")]
pub struct TransportError {
    pub reason: String,
}

impl TransportError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Payload access failure surfaced to the caller.
///
/// Not retried internally: repeated slow round-trips are exactly what the
/// proxy design avoids.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum PayloadError {
    #[error("remote payload unavailable: {reason}")]
    RemoteUnavailable { reason: String },
}

impl PayloadError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

impl From<TransportError> for PayloadError {
    fn from(err: TransportError) -> Self {
        PayloadError::RemoteUnavailable { reason: err.reason }
    }
}

#[derive(Debug, Error)]
pub enum PayloadEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum PayloadDecodeError {
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("text field too long: {got_bytes} exceeds {max_bytes}")]
    StringTooLong { max_bytes: usize, got_bytes: usize },
    #[error("extras map too large: {got_entries} exceeds {max_entries}")]
    TooManyExtras {
        max_entries: usize,
        got_entries: usize,
    },
    #[error("trailing bytes after payload body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

// =============================================================================
// Body codec (CBOR map, string keys, unknown keys skipped)
// =============================================================================

pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, PayloadEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);

    let mut len = 2;
    if payload.title.is_some() {
        len += 1;
    }
    if payload.text.is_some() {
        len += 1;
    }
    if !payload.extras.is_empty() {
        len += 1;
    }

    enc.map(len)?;
    enc.str("flags")?;
    enc.u32(payload.flags.bits())?;
    enc.str("when")?;
    enc.i64(payload.when_ms)?;
    if let Some(title) = &payload.title {
        enc.str("title")?;
        enc.str(title)?;
    }
    if let Some(text) = &payload.text {
        enc.str("text")?;
        enc.str(text)?;
    }
    if !payload.extras.is_empty() {
        enc.str("extras")?;
        enc.map(payload.extras.len() as u64)?;
        for (key, value) in &payload.extras {
            enc.str(key)?;
            enc.str(value)?;
        }
    }

    Ok(buf)
}

pub fn decode_payload(bytes: &[u8], limits: &Limits) -> Result<Payload, PayloadDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = dec.map()?.ok_or(PayloadDecodeError::IndefiniteLength)?;

    let mut flags = None;
    let mut when_ms = None;
    let mut title = None;
    let mut text = None;
    let mut extras = BTreeMap::new();

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "flags" => flags = Some(PayloadFlags::new(dec.u32()?)),
            "when" => when_ms = Some(dec.i64()?),
            "title" => title = Some(decode_text(&mut dec, limits)?.to_string()),
            "text" => text = Some(decode_text(&mut dec, limits)?.to_string()),
            "extras" => {
                let entries = dec.map()?.ok_or(PayloadDecodeError::IndefiniteLength)?;
                let entries = usize::try_from(entries).unwrap_or(usize::MAX);
                if entries > limits.max_extra_entries {
                    return Err(PayloadDecodeError::TooManyExtras {
                        max_entries: limits.max_extra_entries,
                        got_entries: entries,
                    });
                }
                for _ in 0..entries {
                    let k = decode_text(&mut dec, limits)?.to_string();
                    let v = decode_text(&mut dec, limits)?.to_string();
                    extras.insert(k, v);
                }
            }
            _ => {
                dec.skip()?;
            }
        }
    }

    if dec.datatype().is_ok() {
        return Err(PayloadDecodeError::TrailingBytes);
    }

    Ok(Payload {
        flags: flags.ok_or(PayloadDecodeError::MissingField("flags"))?,
        when_ms: when_ms.ok_or(PayloadDecodeError::MissingField("when"))?,
        title,
        text,
        extras,
    })
}

fn decode_text<'b>(dec: &mut Decoder<'b>, limits: &Limits) -> Result<&'b str, PayloadDecodeError> {
    let s = dec.str()?;
    if s.len() > limits.max_string_bytes {
        return Err(PayloadDecodeError::StringTooLong {
            max_bytes: limits.max_string_bytes,
            got_bytes: s.len(),
        });
    }
    Ok(s)
}

// =============================================================================
// Capability
// =============================================================================

/// Capability over a notification payload.
///
/// `payload()` and `flags()` are synchronous and may block when the adapter
/// is remote. `is_local()` answers without any call.
pub trait PayloadSource: Send + Sync {
    /// Retrieve the whole payload.
    fn payload(&self) -> Result<Payload, PayloadError>;

    /// Retrieve only the flag bits.
    fn flags(&self) -> Result<PayloadFlags, PayloadError>;

    /// True when reads are same-process and zero-cost.
    fn is_local(&self) -> bool;

    /// Transferable reference, if this capability can cross the wire.
    fn token(&self) -> Option<PayloadToken> {
        None
    }
}

/// External transport performing the actual remote calls.
///
/// Thread-safety and connection management are the implementor's concern;
/// the proxy only requires the two synchronous calls.
pub trait PayloadTransport: Send + Sync {
    fn fetch_payload(&self, token: PayloadToken) -> Result<Payload, TransportError>;
    fn fetch_flags(&self, token: PayloadToken) -> Result<PayloadFlags, TransportError>;
}

/// Zero-cost adapter over a resident payload.
pub struct LocalPayload {
    payload: Payload,
}

impl LocalPayload {
    pub fn new(payload: Payload) -> Self {
        Self { payload }
    }
}

impl PayloadSource for LocalPayload {
    fn payload(&self) -> Result<Payload, PayloadError> {
        Ok(self.payload.clone())
    }

    fn flags(&self) -> Result<PayloadFlags, PayloadError> {
        Ok(self.payload.flags)
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// Blocking-call adapter over a remote payload.
pub struct RemotePayload {
    token: PayloadToken,
    transport: Arc<dyn PayloadTransport>,
}

impl RemotePayload {
    pub fn new(token: PayloadToken, transport: Arc<dyn PayloadTransport>) -> Self {
        Self { token, transport }
    }
}

impl PayloadSource for RemotePayload {
    fn payload(&self) -> Result<Payload, PayloadError> {
        Ok(self.transport.fetch_payload(self.token)?)
    }

    fn flags(&self) -> Result<PayloadFlags, PayloadError> {
        Ok(self.transport.fetch_flags(self.token)?)
    }

    fn is_local(&self) -> bool {
        false
    }

    fn token(&self) -> Option<PayloadToken> {
        Some(self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Payload {
        let mut extras = BTreeMap::new();
        extras.insert("conversation".to_string(), "alice".to_string());
        Payload {
            flags: PayloadFlags::ONGOING,
            when_ms: 1_700_000_000_000,
            title: Some("title".to_string()),
            text: None,
            extras,
        }
    }

    #[test]
    fn flag_bits_drive_clearability() {
        assert!(PayloadFlags::ONGOING.is_ongoing());
        assert!(!PayloadFlags::ONGOING.is_clearable());
        assert!(!PayloadFlags::NO_CLEAR.is_clearable());
        assert!(PayloadFlags::new(0).is_clearable());
        assert!(!PayloadFlags::new(0).is_ongoing());
    }

    #[test]
    fn payload_roundtrip() {
        let payload = sample_payload();
        let bytes = encode_payload(&payload).unwrap();
        let decoded = decode_payload(&bytes, &Limits::default()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn payload_decode_skips_unknown_keys() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("flags").unwrap();
        enc.u32(0).unwrap();
        enc.str("future").unwrap();
        enc.str("ignored").unwrap();
        enc.str("when").unwrap();
        enc.i64(7).unwrap();

        let decoded = decode_payload(&buf, &Limits::default()).unwrap();
        assert_eq!(decoded.flags, PayloadFlags::new(0));
        assert_eq!(decoded.when_ms, 7);
    }

    #[test]
    fn payload_decode_rejects_missing_flags() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1).unwrap();
        enc.str("when").unwrap();
        enc.i64(7).unwrap();

        let err = decode_payload(&buf, &Limits::default()).unwrap_err();
        assert!(matches!(err, PayloadDecodeError::MissingField("flags")));
    }

    #[test]
    fn payload_decode_enforces_string_limit() {
        let payload = Payload {
            title: Some("x".repeat(64)),
            ..sample_payload()
        };
        let bytes = encode_payload(&payload).unwrap();
        let limits = Limits {
            max_string_bytes: 16,
            ..Limits::default()
        };
        let err = decode_payload(&bytes, &limits).unwrap_err();
        assert!(matches!(err, PayloadDecodeError::StringTooLong { .. }));
    }

    #[test]
    fn payload_decode_enforces_extras_limit() {
        let mut payload = sample_payload();
        for i in 0..8 {
            payload.extras.insert(format!("k{i}"), "v".to_string());
        }
        let bytes = encode_payload(&payload).unwrap();
        let limits = Limits {
            max_extra_entries: 4,
            ..Limits::default()
        };
        let err = decode_payload(&bytes, &limits).unwrap_err();
        assert!(matches!(err, PayloadDecodeError::TooManyExtras { .. }));
    }

    #[test]
    fn local_adapter_reads_straight_through() {
        let source = LocalPayload::new(sample_payload());
        assert!(source.is_local());
        assert!(source.token().is_none());
        assert_eq!(source.payload().unwrap(), sample_payload());
        assert!(source.flags().unwrap().is_ongoing());
    }

    struct FailingTransport;

    impl PayloadTransport for FailingTransport {
        fn fetch_payload(&self, _token: PayloadToken) -> Result<Payload, TransportError> {
            Err(TransportError::new("peer gone"))
        }

        fn fetch_flags(&self, _token: PayloadToken) -> Result<PayloadFlags, TransportError> {
            Err(TransportError::new("peer gone"))
        }
    }

    #[test]
    fn remote_adapter_maps_transport_failure() {
        let source = RemotePayload::new(PayloadToken::new(), Arc::new(FailingTransport));
        assert!(!source.is_local());
        assert!(source.token().is_some());
        let err = source.payload().unwrap_err();
        assert!(matches!(err, PayloadError::RemoteUnavailable { .. }));
        assert_eq!(err.transience(), Transience::Permanent);
        assert!(!err.transience().is_retryable());
    }
}
