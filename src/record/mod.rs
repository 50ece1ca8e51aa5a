//! Notification record types.
//!
//! - plain: the undecorated original record and its pre-existing body codec
//! - key: canonical identity key derivation (host framework contract)
//! - decorated: the decorating proxy owning overrides and the payload cache

pub mod decorated;
pub mod key;
pub mod plain;

pub use decorated::{DecoratedRecord, TagOverride};
pub use key::derive_key;
pub use plain::{NotificationRecord, RecordIdentity, UserHandle};
