#![forbid(unsafe_code)]

pub mod compat;
pub mod config;
pub mod error;
pub mod payload;
pub mod record;
pub mod wire;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the public surface at crate root for convenience
pub use crate::config::Limits;
pub use crate::payload::{
    LocalPayload, Payload, PayloadError, PayloadFlags, PayloadSource, PayloadToken,
    PayloadTransport, RemotePayload, TransportError,
};
pub use crate::record::{
    derive_key, DecoratedRecord, NotificationRecord, RecordIdentity, TagOverride, UserHandle,
};
pub use crate::wire::{
    apply_reply, decode_record, encode_record, Decoration, Frame, PayloadRef, WireError,
};
