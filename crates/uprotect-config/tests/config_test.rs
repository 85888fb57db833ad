#![allow(clippy::unwrap_used)]
// Config loading against real files in a temp dir.

use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::ExposeSecret;

use uprotect_config::{
    Config, ConfigError, Defaults, Profile, load_config_from, profile_to_controller_config,
    resolve_profile, save_config_to,
};
use uprotect_core::TlsVerification;

const SAMPLE: &str = r#"
default_profile = "home"

[defaults]
timeout = 15
failure_threshold = 3
cooldown = 60

[profiles.home]
controller = "192.168.1.1"
username = "viewer"
password = "plaintext-secret"

[profiles.office]
controller = "https://protect.office.example:7443"
username = "ops"
insecure = false
timeout = 5
"#;

fn write_sample(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, SAMPLE).unwrap();
    path
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config_from(&dir.path().join("absent.toml")).unwrap();

    assert_eq!(config.default_profile.as_deref(), Some("default"));
    assert_eq!(config.defaults, Defaults::default());
    assert!(config.profiles.is_empty());
}

#[test]
fn test_profiles_and_defaults_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config_from(&write_sample(&dir)).unwrap();

    assert_eq!(config.defaults.timeout, 15);
    assert_eq!(config.defaults.failure_threshold, 3);
    assert!(config.defaults.insecure);
    assert_eq!(config.profiles.len(), 2);

    let (name, home) = config.profile(None).unwrap();
    assert_eq!(name, "home");
    assert_eq!(home.controller, "192.168.1.1");
}

#[test]
fn test_profile_translates_to_controller_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config_from(&write_sample(&dir)).unwrap();

    let (_, office) = config.profile(Some("office")).unwrap();
    let controller = profile_to_controller_config(office, &config.defaults).unwrap();

    assert_eq!(
        controller.url.as_str(),
        "https://protect.office.example:7443/"
    );
    assert_eq!(controller.tls, TlsVerification::SystemDefaults);
    assert_eq!(controller.timeout, Duration::from_secs(5));
    assert_eq!(controller.retry.failure_threshold, 3);
    assert_eq!(controller.retry.cooldown, Duration::from_secs(60));
}

#[test]
fn test_resolve_profile_uses_plaintext_password() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config_from(&write_sample(&dir)).unwrap();

    let resolved = resolve_profile(&config, None).unwrap();
    assert_eq!(resolved.name, "home");
    assert_eq!(resolved.address, "192.168.1.1");
    assert_eq!(resolved.username, "viewer");
    assert_eq!(resolved.password.expose_secret(), "plaintext-secret");
    assert_eq!(resolved.controller.url.as_str(), "https://192.168.1.1/");
    assert_eq!(
        resolved.controller.tls,
        TlsVerification::DangerAcceptInvalid
    );
}

#[test]
fn test_unknown_profile() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config_from(&write_sample(&dir)).unwrap();

    assert!(matches!(
        resolve_profile(&config, Some("garage")),
        Err(ConfigError::UnknownProfile { .. })
    ));
}

#[test]
fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.profiles.insert(
        "default".into(),
        Profile {
            controller: "nvr.local".into(),
            username: Some("admin".into()),
            timeout: Some(20),
            ..Profile::default()
        },
    );
    save_config_to(&config, &path).unwrap();

    let loaded = load_config_from(&path).unwrap();
    assert_eq!(loaded, config);
}
