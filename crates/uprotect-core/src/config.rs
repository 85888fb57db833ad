// ── Runtime connection configuration ──
//
// These types describe *how* to talk to a Protect controller: TLS policy,
// timeouts, retry/breaker tuning and token header names. They never touch
// disk. uprotect-config (or the embedding application) builds a
// `ControllerConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;
use uprotect_api::transport::{TlsMode, TransportConfig};

use crate::error::CoreError;

pub use uprotect_api::{ReconnectConfig, TokenHeaders};

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(PathBuf),
    /// Skip verification. Protect consoles ship self-signed certificates.
    #[default]
    DangerAcceptInvalid,
}

impl From<&TlsVerification> for TlsMode {
    fn from(tls: &TlsVerification) -> Self {
        match tls {
            TlsVerification::SystemDefaults => TlsMode::System,
            TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
            TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
        }
    }
}

/// Circuit breaker tuning for the request executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before trying again.
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Configuration for talking to a single controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Controller base URL (e.g., `https://192.168.1.1`).
    pub url: Url,
    /// TLS verification strategy.
    pub tls: TlsVerification,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Breaker threshold and cooldown.
    pub retry: RetryPolicy,
    /// Backoff schedule for the realtime updates socket.
    pub reconnect: ReconnectConfig,
    /// Session cookie and CSRF header names.
    pub token_headers: TokenHeaders,
}

impl ControllerConfig {
    /// Defaults for the controller at `url`.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            tls: TlsVerification::default(),
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            reconnect: ReconnectConfig::default(),
            token_headers: TokenHeaders::default(),
        }
    }

    /// Defaults for a controller given as a host, IP or base URL.
    pub fn from_address(address: &str) -> Result<Self, CoreError> {
        Ok(Self::new(uprotect_api::controller_url(address)?))
    }

    pub(crate) fn transport(&self) -> TransportConfig {
        TransportConfig {
            tls: TlsMode::from(&self.tls),
            timeout: self.timeout,
        }
    }
}
