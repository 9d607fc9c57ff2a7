use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::constants::{GROUP_CHANNEL_NAME, NAME_FORBIDDEN_CHARS};
use crate::error::ValidationError;

// User display name. Never contains the wire metacharacters `,` `=` `\n`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(String);

impl Name {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if let Some(c) = value.chars().find(|c| NAME_FORBIDDEN_CHARS.contains(c)) {
            return Err(ValidationError::ForbiddenCharacter(c));
        }
        Ok(Self(value))
    }

    /// Label given to channels with more than two participants.
    pub fn group_channel() -> Self {
        Self(GROUP_CHANNEL_NAME.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-folded form, used wherever two spellings of a name must share storage.
    pub fn folded(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Name {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A chat message as stored in a channel log. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    author: Name,
    content: String,
}

impl Message {
    pub fn new(author: Name, content: impl Into<String>) -> Result<Self, ValidationError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ValidationError::BlankContent);
        }
        Ok(Self { author, content })
    }

    pub fn author(&self) -> &Name {
        &self.author
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.author, self.content)
    }
}
