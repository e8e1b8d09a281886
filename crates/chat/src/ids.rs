use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{ChatError, ChatResult, InvalidConversationIdSnafu};

const CONVERSATION_ID_PREFIX: &str = "conv_";

/// Opaque conversation identifier.
///
/// Backed by a UUID v7: a millisecond clock plus a per-process monotonic counter,
/// so ids minted by one process never repeat and sort by creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ConversationId(Uuid);

impl ConversationId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    /// Accepts both the displayed `conv_<uuid>` form and a bare UUID.
    pub fn parse(raw: &str) -> ChatResult<Self> {
        let trimmed = raw.trim();
        let uuid_text = trimmed
            .strip_prefix(CONVERSATION_ID_PREFIX)
            .unwrap_or(trimmed);
        let parsed = Uuid::parse_str(uuid_text).context(InvalidConversationIdSnafu {
            stage: "parse-conversation-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{CONVERSATION_ID_PREFIX}{}", self.0.simple())
    }
}

impl FromStr for ConversationId {
    type Err = ChatError;

    fn from_str(raw: &str) -> ChatResult<Self> {
        Self::parse(raw)
    }
}

impl From<ConversationId> for String {
    fn from(value: ConversationId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ConversationId {
    type Error = ChatError;

    fn try_from(value: String) -> ChatResult<Self> {
        Self::parse(&value)
    }
}
