//! Protocol errors.

use thiserror::Error;

/// A peer sent something that is not a valid envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or does not have the envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The `Head.Event` code is not a known category.
    #[error("unknown event category {0}")]
    UnknownCategory(i32),

    /// The `Body.SubEvent` code is not defined for the category.
    #[error("unknown sub-event {code} for {category}")]
    UnknownSubEvent { category: &'static str, code: i32 },

    /// The `Body.Info` payload does not match the shape the sub-event requires.
    #[error("invalid {context} payload: {reason}")]
    InvalidInfo {
        context: &'static str,
        reason: String,
    },

    /// The envelope is well formed but not acceptable at this point.
    #[error("unexpected event: {0}")]
    Unexpected(String),
}
