use thiserror::Error;

/// Errors returned by sessions, plugin handles and transports.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The HTTP request itself failed (connection refused, timeout, bad body...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport was closed by `destroy()` and can no longer be used.
    #[error("transport is closed")]
    TransportClosed,

    /// The gateway answered with a `janus` kind we did not ask for.
    #[error("unexpected gateway reply: expected `{expected}`, got `{got}`")]
    UnexpectedReply { expected: &'static str, got: String },

    /// The gateway answered with `{"janus":"error"}`.
    #[error("gateway rejected request ({code}): {reason}")]
    Rejected { code: i64, reason: String },

    /// The next event in a handle's inbox belongs to another request.
    #[error("transaction mismatch: expected `{expected}`, got `{got}`")]
    TransactionMismatch { expected: String, got: String },

    /// A reply was missing a field the protocol requires.
    #[error("missing field `{0}` in gateway reply")]
    MissingField(&'static str),

    /// The request body handed to `send` is not usable.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The operation is not valid in the session's current state.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// The owning session has been dropped.
    #[error("session is gone")]
    SessionGone,

    /// The handle was detached or its session destroyed while a `send` was
    /// waiting for its event.
    #[error("inbox closed")]
    InboxClosed,

    /// Another `send` is already waiting on this handle.
    #[error("a request is already in flight on plugin {0}")]
    SendInProgress(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> GatewayError {
        GatewayError::Transport(err.to_string())
    }
}

impl GatewayError {
    /// True for errors that mean the caller's view of the protocol is out of
    /// sync with the gateway.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            GatewayError::UnexpectedReply { .. }
                | GatewayError::Rejected { .. }
                | GatewayError::TransactionMismatch { .. }
                | GatewayError::MissingField(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violations_are_classified() {
        let mismatch = GatewayError::TransactionMismatch {
            expected: "abc".into(),
            got: "xyz".into(),
        };
        assert!(mismatch.is_protocol_violation());
        assert!(!GatewayError::TransportClosed.is_protocol_violation());
        assert!(!GatewayError::Transport("refused".into()).is_protocol_violation());
    }

    #[test]
    fn display_carries_context() {
        let err = GatewayError::InvalidState {
            operation: "attach",
            state: "idle",
        };
        assert_eq!(err.to_string(), "cannot attach while session is idle");
    }
}
