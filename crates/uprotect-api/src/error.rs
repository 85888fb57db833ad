use thiserror::Error;

use crate::codec::DecodeError;
use crate::fmp4::DemuxError;

/// Top-level error type for the `uprotect-api` crate.
///
/// Covers the wire-level failure modes: authentication, HTTP transport,
/// controller responses, WebSocket plumbing, and the two binary decoders.
/// `uprotect-core` maps these into its user-facing taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login rejected (wrong credentials, locked account, ...).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Controller answered 401/403 to an authenticated request.
    #[error("Session rejected by controller (HTTP {status})")]
    SessionRejected { status: u16 },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Controller responses ────────────────────────────────────────
    /// Non-success HTTP status that isn't an auth rejection.
    #[error("Protect API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Binary protocols ────────────────────────────────────────────
    #[error("Update packet decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Livestream demux failed: {0}")]
    Demux(#[from] DemuxError),
}

impl Error {
    /// Returns `true` if the controller rejected our session and a fresh
    /// login might resolve it.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, Self::SessionRejected { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => *status >= 500,
            Self::WebSocketConnect(_) | Self::WebSocketClosed { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}
