//! Conversation identity shared by the session registry and window buffer.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identifier of one logical conversation.
///
/// Never empty: callers without an id use [`ConversationKey::UNKNOWN`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Sentinel used when no conversation id is supplied.
    pub const UNKNOWN: &'static str = "unknown";

    /// Wrap `key`; blank keys become the sentinel.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        if key.trim().is_empty() {
            Self::unknown()
        } else {
            Self(key)
        }
    }

    /// The sentinel key.
    #[must_use]
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_owned())
    }

    /// Key for an optional caller-supplied id.
    pub fn from_optional<S: Into<String>>(key: Option<S>) -> Self {
        key.map_or_else(Self::unknown, Self::new)
    }

    /// Whether this is the sentinel.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationKey {
    fn default() -> Self {
        Self::unknown()
    }
}

impl Display for ConversationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConversationKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
