//! Boundary errors for incoming events.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why an event was refused at the transport boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// A required field has the wrong shape.
    #[error("event field `{field}` rejected: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("event JSON rejected: {0}")]
    Json(#[from] serde_json::Error),

    /// The nostr crate could not parse the event.
    #[error("nostr event rejected: {0}")]
    Nostr(#[from] nostr::event::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_error_names_field() {
        let err = Error::InvalidField {
            field: "sig",
            reason: "expected 128 hex characters, got 3".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "event field `sig` rejected: expected 128 hex characters, got 3"
        );
    }

    #[test]
    fn test_json_error_converts() {
        let err: Error = serde_json::from_str::<u64>("[]").unwrap_err().into();
        assert!(matches!(err, Error::Json(_)));
    }
}
