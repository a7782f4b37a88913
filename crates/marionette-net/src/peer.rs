//! Peer and room identifiers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

/// Length of the random suffix in generated identifiers.
const RANDOM_SUFFIX_LEN: usize = 10;

/// Identifier of one participant's endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

/// A room is identified by its host's peer id.
pub type RoomId = PeerId;

impl PeerId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier of the form `{prefix}-{suffix}`.
    pub fn random(prefix: &str) -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_SUFFIX_LEN)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self(format!("{prefix}-{suffix}"))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Wall-clock milliseconds since the Unix epoch.
///
/// Used for wire timestamps; a clock set before 1970 reads as 0.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_have_prefix_and_differ() {
        let a = PeerId::random("room");
        let b = PeerId::random("room");
        assert!(a.as_str().starts_with("room-"));
        assert_eq!(a.as_str().len(), "room-".len() + RANDOM_SUFFIX_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_matches_inner_string() {
        let id = PeerId::from("host-1");
        assert_eq!(id.to_string(), "host-1");
    }

    #[test]
    fn test_unix_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(unix_millis() > 1_577_836_800_000);
    }
}
