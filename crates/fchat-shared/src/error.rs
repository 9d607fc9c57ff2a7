use thiserror::Error;

/// Rejected construction of a data-model value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Name cannot contain {0:?}")]
    ForbiddenCharacter(char),

    #[error("Message content cannot be blank")]
    BlankContent,
}

/// The producer of an event stream was dropped before completing it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Event stream ended without completing")]
pub struct StreamAbandoned;

/// Failure to turn a frame payload back into a packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Packet is not valid UTF-8")]
    NotUtf8,

    #[error("Packet has no type field")]
    MissingType,

    #[error("Unknown packet type: {0}")]
    UnknownType(String),

    #[error("Packet is missing field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl DecodeError {
    pub(crate) fn invalid(field: &'static str, reason: impl ToString) -> Self {
        DecodeError::InvalidField {
            field,
            reason: reason.to_string(),
        }
    }
}
