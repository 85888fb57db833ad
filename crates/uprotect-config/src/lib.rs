//! Profile configuration for Protect integrations.
//!
//! TOML profiles, password resolution (env + keyring + plaintext), and
//! translation to `uprotect_core::ControllerConfig`. The core crate never
//! reads files; this crate is the bridge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use uprotect_core::{ControllerConfig, ReconnectConfig, RetryPolicy, TlsVerification};

/// Keyring service name; entries are keyed `{profile}/password`.
const KEYRING_SERVICE: &str = "uprotect";

/// Fallback password variable when a profile names none.
const PASSWORD_ENV: &str = "UPROTECT_PASSWORD";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{profile}' not found")]
    UnknownProfile { profile: String },

    #[error("no credentials configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named controller profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.into(),
            })
    }
}

/// Settings every profile inherits unless it overrides them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_insecure")]
    pub insecure: bool,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Consecutive failures before requests fail fast.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before trying again.
    #[serde(default = "default_cooldown")]
    pub cooldown: u64,

    /// Cap on the realtime updates reconnect delay, in seconds.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            insecure: default_insecure(),
            timeout: default_timeout(),
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            reconnect_max: default_reconnect_max(),
        }
    }
}

fn default_insecure() -> bool {
    true
}
fn default_timeout() -> u64 {
    10
}
fn default_failure_threshold() -> u32 {
    RetryPolicy::default().failure_threshold
}
fn default_cooldown() -> u64 {
    RetryPolicy::default().cooldown.as_secs()
}
fn default_reconnect_max() -> u64 {
    ReconnectConfig::default().max_delay.as_secs()
}

/// A named controller profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    /// Controller host, IP or base URL.
    pub controller: String,

    pub username: Option<String>,

    /// Plaintext password. Prefer the keyring or an env var.
    pub password: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,

    /// Path to a custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    /// Override `defaults.insecure`.
    pub insecure: Option<bool>,

    /// Override `defaults.timeout`.
    pub timeout: Option<u64>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "uprotect", "uprotect").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("uprotect");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Loading / saving ────────────────────────────────────────────────

/// Load the config from the canonical path and `UPROTECT_` variables.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the config from `path` and `UPROTECT_` variables.
///
/// A missing file is not an error; defaults apply.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("UPROTECT_").split("__"));

    Ok(figment.extract()?)
}

/// Write `cfg` to the canonical path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(cfg)?)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Username and password for a profile.
///
/// The password comes from the profile's `password_env` (or
/// `UPROTECT_PASSWORD`), then the system keyring, then plaintext config.
pub fn resolve_credentials(
    profile: &Profile,
    profile_name: &str,
) -> Result<(String, SecretString), ConfigError> {
    let no_credentials = || ConfigError::NoCredentials {
        profile: profile_name.into(),
    };

    let username = profile
        .username
        .clone()
        .or_else(|| std::env::var("UPROTECT_USERNAME").ok())
        .ok_or_else(no_credentials)?;

    // 1. Env var
    let env_name = profile.password_env.as_deref().unwrap_or(PASSWORD_ENV);
    if let Ok(pw) = std::env::var(env_name) {
        return Ok((username, SecretString::from(pw)));
    }

    // 2. Keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/password")) {
        if let Ok(pw) = entry.get_password() {
            return Ok((username, SecretString::from(pw)));
        }
    }

    // 3. Plaintext in config
    if let Some(ref pw) = profile.password {
        return Ok((username, SecretString::from(pw.clone())));
    }

    Err(no_credentials())
}

// ── Translation ─────────────────────────────────────────────────────

/// Build a `ControllerConfig` for `profile`, filling gaps from `defaults`.
pub fn profile_to_controller_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<ControllerConfig, ConfigError> {
    let mut config =
        ControllerConfig::from_address(&profile.controller).map_err(|e| {
            ConfigError::Validation {
                field: "controller".into(),
                reason: format!("{}: {e}", profile.controller),
            }
        })?;

    config.tls = if let Some(ref ca_path) = profile.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else if profile.insecure.unwrap_or(defaults.insecure) {
        TlsVerification::DangerAcceptInvalid
    } else {
        TlsVerification::SystemDefaults
    };

    config.timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));
    config.retry = RetryPolicy {
        failure_threshold: defaults.failure_threshold,
        cooldown: Duration::from_secs(defaults.cooldown),
    };
    config.reconnect.max_delay = Duration::from_secs(defaults.reconnect_max);

    Ok(config)
}

/// Everything needed to log in with one profile.
#[derive(Debug)]
pub struct ResolvedProfile {
    pub name: String,
    /// Address passed to `ProtectController::login`.
    pub address: String,
    pub controller: ControllerConfig,
    pub username: String,
    pub password: SecretString,
}

/// Resolve profile `name` (or the default) into a controller config and
/// credentials.
pub fn resolve_profile(config: &Config, name: Option<&str>) -> Result<ResolvedProfile, ConfigError> {
    let (name, profile) = config.profile(name)?;
    let controller = profile_to_controller_config(profile, &config.defaults)?;
    let (username, password) = resolve_credentials(profile, name)?;

    Ok(ResolvedProfile {
        name: name.to_owned(),
        address: profile.controller.clone(),
        controller,
        username,
        password,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn unknown_profile_is_reported() {
        let config = Config::default();
        assert!(matches!(
            config.profile(None),
            Err(ConfigError::UnknownProfile { profile }) if profile == "default"
        ));
    }

    #[test]
    fn ca_cert_wins_over_insecure() {
        let profile = Profile {
            controller: "nvr.local".into(),
            ca_cert: Some("/etc/ssl/protect.pem".into()),
            insecure: Some(true),
            ..Profile::default()
        };
        let config = profile_to_controller_config(&profile, &Defaults::default()).unwrap();
        assert_eq!(
            config.tls,
            TlsVerification::CustomCa("/etc/ssl/protect.pem".into())
        );
    }

    #[test]
    fn bad_controller_address_is_validation_error() {
        let profile = Profile {
            controller: "http://[::1".into(),
            ..Profile::default()
        };
        assert!(matches!(
            profile_to_controller_config(&profile, &Defaults::default()),
            Err(ConfigError::Validation { field, .. }) if field == "controller"
        ));
    }
}
