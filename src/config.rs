//! Codec safety limits (normative defaults).

use serde::{Deserialize, Serialize};

/// Decode/encode bounds threaded through the wire codec.
///
/// Values are intentionally explicit about their units to avoid confusion.
/// Oversized fields are errors, never truncations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub max_payload_bytes: usize,
    pub max_string_bytes: usize,
    pub max_extra_entries: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            max_payload_bytes: 512 * 1024,
            max_string_bytes: 4 * 1024,
            max_extra_entries: 128,
        }
    }
}
