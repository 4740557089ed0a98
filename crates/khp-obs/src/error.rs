//! Error taxonomy for the OBS client.

use thiserror::Error;

use crate::protocol::status;

/// Errors surfaced by [`Session`](crate::Session) operations.
///
/// `Clone` because a single link failure is stored into every pending slot
/// of that link.
#[derive(Clone, Debug, Error)]
pub enum ObsError {
    /// The transport could not be opened, or closed before the greeting.
    #[error("cannot connect to {endpoint}: {reason}")]
    ConnectFailed {
        /// `host:port` we tried.
        endpoint: String,
        /// Why it failed.
        reason: String,
    },

    /// A message had the wrong shape or arrived out of sequence.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected or hung up on our identification.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No response within the request timeout. The request may still have
    /// been executed by the server.
    #[error("{request_type} timed out after {timeout_ms}ms (outcome unknown)")]
    Timeout {
        /// The request that timed out.
        request_type: String,
        /// How long we waited.
        timeout_ms: u64,
    },

    /// The link died while the request was in flight.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Transport-level cause.
        reason: String,
    },

    /// The server answered with `result: false`.
    #[error("{request_type} failed with code {code}{}", comment_suffix(.comment.as_deref()))]
    Remote {
        /// The request that failed.
        request_type: String,
        /// obs-websocket `RequestStatus` code.
        code: u16,
        /// Server-provided explanation.
        comment: Option<String>,
    },
}

fn comment_suffix(comment: Option<&str>) -> String {
    comment.map(|c| format!(": {c}")).unwrap_or_default()
}

impl ObsError {
    /// The remote status code, for [`ObsError::Remote`] only.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this is the "resource already exists" naming conflict.
    ///
    /// Callers creating scenes or inputs use it to retry under a new name.
    pub fn is_already_exists(&self) -> bool {
        self.code() == Some(status::RESOURCE_ALREADY_EXISTS)
    }

    /// Whether reconnecting and re-issuing could plausibly succeed.
    ///
    /// Advisory only: the client never retries by itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. } | Self::ConnectFailed { .. })
    }
}

/// Result type for OBS client operations.
pub type Result<T> = std::result::Result<T, ObsError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(code: u16, comment: Option<&str>) -> ObsError {
        ObsError::Remote {
            request_type: "CreateScene".into(),
            code,
            comment: comment.map(Into::into),
        }
    }

    #[test]
    fn remote_display_with_comment() {
        let err = remote(601, Some("A scene by that name already exists."));
        assert_eq!(
            err.to_string(),
            "CreateScene failed with code 601: A scene by that name already exists."
        );
    }

    #[test]
    fn remote_display_without_comment() {
        assert_eq!(remote(702, None).to_string(), "CreateScene failed with code 702");
    }

    #[test]
    fn code_only_for_remote() {
        assert_eq!(remote(600, None).code(), Some(600));
        assert_eq!(ObsError::Protocol("x".into()).code(), None);
    }

    #[test]
    fn already_exists_is_601() {
        assert!(remote(601, None).is_already_exists());
        assert!(!remote(600, None).is_already_exists());
        assert!(!ObsError::AuthFailed("x".into()).is_already_exists());
    }

    #[test]
    fn retryable_variants() {
        assert!(ObsError::ConnectionLost { reason: "eof".into() }.is_retryable());
        assert!(
            ObsError::ConnectFailed {
                endpoint: "localhost:4455".into(),
                reason: "refused".into(),
            }
            .is_retryable()
        );
        assert!(
            !ObsError::Timeout {
                request_type: "GetVersion".into(),
                timeout_ms: 10,
            }
            .is_retryable()
        );
        assert!(!remote(601, None).is_retryable());
    }

    #[test]
    fn timeout_display_mentions_unknown_outcome() {
        let err = ObsError::Timeout {
            request_type: "GetSceneList".into(),
            timeout_ms: 10_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("GetSceneList"));
        assert!(msg.contains("10000ms"));
        assert!(msg.contains("outcome unknown"));
    }
}
