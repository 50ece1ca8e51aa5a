//! The decorating proxy.
//!
//! Wraps an immutable record and lets a caller override the display tag and
//! numeric id without touching the original, while tracking whether the
//! heavy payload has been fetched locally or still lives behind a remote
//! capability. Single-threaded ownership per instance; `Clone` is the
//! hand-off mechanism.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, warn};

use crate::compat::{self, HostRecord};
use crate::payload::{LocalPayload, Payload, PayloadError, PayloadSource};

use super::key::derive_key;
use super::plain::{NotificationRecord, RecordIdentity};

/// Tag decoration state.
///
/// The tagged variant makes "no override" and "override to an absent tag"
/// distinct by construction; no separate flag can drift out of sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagOverride {
    /// Use the original tag.
    Original,
    /// Use this value, which may itself be absent.
    Overridden(Option<String>),
}

/// Decorating proxy over an immutable notification record.
pub struct DecoratedRecord {
    identity: RecordIdentity,
    source: Arc<dyn PayloadSource>,
    original_key: String,
    tag: TagOverride,
    id: Option<i32>,
    key: Option<String>,
    // Cache of the remote payload to avoid expensive duplicate fetch.
    fetched: Option<Payload>,
    reply_encode: bool,
}

impl DecoratedRecord {
    pub fn new(identity: RecordIdentity, source: Arc<dyn PayloadSource>) -> Self {
        let original_key = identity.key();
        Self {
            identity,
            source,
            original_key,
            tag: TagOverride::Original,
            id: None,
            key: None,
            fetched: None,
            reply_encode: false,
        }
    }

    /// Wrap a plain record; its resident payload becomes a local capability.
    pub fn from_record(record: NotificationRecord) -> Self {
        let NotificationRecord { identity, payload } = record;
        Self::new(identity, Arc::new(LocalPayload::new(payload)))
    }

    /// Wrap a foreign host record, recovering the uid through the explicit
    /// accessor seam. An unavailable uid degrades to the sentinel 0 instead
    /// of failing construction.
    pub fn from_host(host: &dyn HostRecord) -> Self {
        let uid = compat::recover_uid(host);
        let identity = RecordIdentity {
            package: host.package().to_string(),
            id: host.id(),
            tag: host.tag().map(str::to_string),
            uid,
            initial_pid: 0,
            score: 0,
            user: host.user(),
            override_group_key: host.override_group_key().map(str::to_string),
            post_time_ms: host.post_time_ms(),
        };
        Self::new(identity, Arc::new(LocalPayload::new(host.payload())))
    }

    // =========================================================================
    // Decoration
    // =========================================================================

    /// Override the tag. Overriding with the original tag clears the
    /// decoration instead; overriding with the current effective tag is a
    /// no-op. Recomputes the derived key. Pure data mutation, no I/O.
    pub fn set_tag(&mut self, tag: Option<String>) -> &mut Self {
        if tag.as_deref() == self.tag() {
            return self;
        }
        if tag.as_deref() == self.identity.tag.as_deref() {
            self.tag = TagOverride::Original;
        } else {
            self.tag = TagOverride::Overridden(tag);
        }
        self.recompute_key();
        self
    }

    /// Override the id, with the same collapsing logic as [`Self::set_tag`].
    pub fn set_id(&mut self, id: i32) -> &mut Self {
        if id == self.id() {
            return self;
        }
        if id == self.identity.id {
            self.id = None;
        } else {
            self.id = Some(id);
        }
        self.recompute_key();
        self
    }

    /// Mark this instance so its next encode emits the incremental-reply
    /// frame, for returning the same object as the result of the call that
    /// delivered it.
    pub fn mark_reply(&mut self) {
        self.reply_encode = true;
    }

    // Initial pid and score have no contribution to the derived key.
    fn recompute_key(&mut self) {
        if self.id.is_none() && matches!(self.tag, TagOverride::Original) {
            self.key = None;
            return;
        }
        let key = derive_key(
            self.identity.user,
            &self.identity.package,
            self.id(),
            self.tag(),
            self.identity.uid,
            self.identity.override_group_key.as_deref(),
        );
        self.key = Some(key);
    }

    /// Bind decoration fields as-received from the wire, without collapsing.
    /// An override equal to the original is tolerated; the invariant is
    /// re-established by the next mutator.
    pub(crate) fn bind_decoration(&mut self, id_override: Option<i32>, tag_override: TagOverride) {
        self.id = id_override;
        self.tag = tag_override;
        self.recompute_key();
    }

    pub(crate) fn from_wire(
        identity: RecordIdentity,
        source: Arc<dyn PayloadSource>,
        id_override: Option<i32>,
        tag_override: TagOverride,
    ) -> Self {
        let mut record = Self::new(identity, source);
        record.bind_decoration(id_override, tag_override);
        record
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Effective tag: the override if present, else the original.
    pub fn tag(&self) -> Option<&str> {
        match &self.tag {
            TagOverride::Original => self.identity.tag.as_deref(),
            TagOverride::Overridden(tag) => tag.as_deref(),
        }
    }

    /// Effective id: the override if present, else the original.
    pub fn id(&self) -> i32 {
        self.id.unwrap_or(self.identity.id)
    }

    /// Effective key: the derived key once decoration is applied, else the
    /// original record's own key.
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.original_key)
    }

    pub fn original_tag(&self) -> Option<&str> {
        self.identity.tag.as_deref()
    }

    pub fn original_id(&self) -> i32 {
        self.identity.id
    }

    pub fn original_key(&self) -> &str {
        &self.original_key
    }

    pub fn identity(&self) -> &RecordIdentity {
        &self.identity
    }

    pub fn tag_override(&self) -> &TagOverride {
        &self.tag
    }

    pub fn id_override(&self) -> Option<i32> {
        self.id
    }

    /// Whether a derived key is currently cached (any decoration active).
    pub fn is_decorated(&self) -> bool {
        self.key.is_some()
    }

    pub(crate) fn fetched_payload(&self) -> Option<&Payload> {
        self.fetched.as_ref()
    }

    pub(crate) fn reply_marked(&self) -> bool {
        self.reply_encode
    }

    // =========================================================================
    // Payload access
    // =========================================================================

    /// The payload capability, without triggering a fetch. Preferred for
    /// metadata-only reads.
    pub fn payload_source(&self) -> &Arc<dyn PayloadSource> {
        &self.source
    }

    /// Retrieve the whole payload.
    ///
    /// Returns the cached copy if one exists. A local capability reads
    /// straight through without caching. A remote capability performs one
    /// blocking round-trip, logs the elapsed time, and caches the result;
    /// subsequent encodes of this record then inline the payload bytes
    /// instead of forwarding the capability reference.
    pub fn payload(&mut self) -> Result<Payload, PayloadError> {
        if let Some(payload) = &self.fetched {
            return Ok(payload.clone());
        }
        if self.source.is_local() {
            return self.source.payload();
        }
        let started = Instant::now();
        match self.source.payload() {
            Ok(payload) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(
                    key = %self.key(),
                    elapsed_ms,
                    "retrieved whole instance of remote payload"
                );
                self.fetched = Some(payload.clone());
                Ok(payload)
            }
            Err(err) => {
                error!(key = %self.key(), "failed to retrieve remote payload");
                Err(err)
            }
        }
    }

    /// Whether the payload is flagged as an ongoing event. Reads flag bits
    /// through the capability; a failed capability call is a non-retryable
    /// structural error.
    pub fn is_ongoing(&self) -> Result<bool, PayloadError> {
        Ok(self.source.flags()?.is_ongoing())
    }

    /// Whether the payload can be cleared by the user.
    pub fn is_clearable(&self) -> Result<bool, PayloadError> {
        Ok(self.source.flags()?.is_clearable())
    }
}

/// Duplicates identity and decoration only. The clone shares the capability
/// but starts with an empty payload cache and a cleared reply mark, keeping
/// hand-off cost bounded.
impl Clone for DecoratedRecord {
    fn clone(&self) -> Self {
        let mut clone = Self {
            identity: self.identity.clone(),
            source: Arc::clone(&self.source),
            original_key: self.original_key.clone(),
            tag: self.tag.clone(),
            id: self.id,
            key: None,
            fetched: None,
            reply_encode: false,
        };
        clone.recompute_key();
        clone
    }
}

impl fmt::Display for DecoratedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecoratedRecord(key={}", self.original_key)?;
        if let Some(key) = &self.key {
            write!(f, " -> {key}")?;
        }
        let locality = if self.source.is_local() {
            "local payload"
        } else {
            "remote payload"
        };
        write!(f, ": {locality})")
    }
}

impl fmt::Debug for DecoratedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DecoratedRecord(key={:?}, decorated={}, local={})",
            self.key(),
            self.is_decorated(),
            self.source.is_local()
        )
    }
}
