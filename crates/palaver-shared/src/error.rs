use thiserror::Error;

/// Errors produced while parsing identifiers or wire frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A frame that is not valid JSON for the expected shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error("invalid group id: {0:?}")]
    InvalidGroupId(String),

    /// A recipient whose namespace prefix is neither `U` nor `G`.
    #[error("unknown recipient scope: {0:?}")]
    UnknownRecipientScope(String),

    #[error("node id {0} out of range")]
    NodeIdOutOfRange(u16),
}
