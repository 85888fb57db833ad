// ── Core error types ──
//
// User-facing errors from uprotect-core. Callers never match on HTTP
// plumbing directly: the `From<uprotect_api::Error>` impl folds the wire
// layer into authentication, transport, permission and stream failures.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Not logged in to a Protect controller")]
    NotAuthenticated,

    // ── Transport ────────────────────────────────────────────────────
    #[error("Cannot reach Protect controller: {message}")]
    Transport { message: String },

    #[error(
        "Controller unavailable after {failures} consecutive failures (retrying in {retry_in_secs}s)"
    )]
    CircuitOpen { failures: u32, retry_in_secs: u64 },

    #[error("Protect API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected controller response: {message}")]
    Deserialization { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── Permissions ──────────────────────────────────────────────────
    #[error("Permission denied: {operation} requires an administrator account")]
    PermissionDenied { operation: String },

    // ── Streams ──────────────────────────────────────────────────────
    #[error("Stream error: {message}")]
    Stream { message: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    /// Whether this failure came from the controller or the network
    /// rather than from local state.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::CircuitOpen { .. } | Self::Api { .. }
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<uprotect_api::Error> for CoreError {
    fn from(err: uprotect_api::Error) -> Self {
        use uprotect_api::Error as E;

        match err {
            E::Authentication { message } => CoreError::AuthenticationFailed { message },
            E::SessionRejected { status } => CoreError::AuthenticationFailed {
                message: format!("session rejected by controller (HTTP {status})"),
            },
            E::Transport(e) => CoreError::Transport {
                message: e.to_string(),
            },
            E::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            E::Tls(message) => CoreError::Transport {
                message: format!("TLS error: {message}"),
            },
            E::Api { status, message } => CoreError::Api { status, message },
            E::Deserialization { message, body: _ } => CoreError::Deserialization { message },
            E::WebSocketConnect(reason) => CoreError::Stream {
                message: format!("WebSocket connection failed: {reason}"),
            },
            E::WebSocketClosed { code, reason } => CoreError::Stream {
                message: format!("WebSocket closed (code {code}): {reason}"),
            },
            E::Decode(e) => CoreError::Stream {
                message: e.to_string(),
            },
            E::Demux(e) => CoreError::Stream {
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_errors_map_into_taxonomy() {
        let auth: CoreError = uprotect_api::Error::SessionRejected { status: 401 }.into();
        assert!(matches!(auth, CoreError::AuthenticationFailed { .. }));

        let api: CoreError = uprotect_api::Error::Api {
            status: 500,
            message: "boom".into(),
        }
        .into();
        assert!(api.is_transport());

        let stream: CoreError = uprotect_api::Error::WebSocketClosed {
            code: 1006,
            reason: "abnormal".into(),
        }
        .into();
        assert!(matches!(stream, CoreError::Stream { .. }));
        assert!(!stream.is_transport());
    }
}
