use sf_core::config::{Config, MasterKeyProvider, MAX_WINDOW_HOURS};
use sf_core::crypto::EncryptionLevel;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert!(!cfg.general.log_json);
    assert_eq!(cfg.fleet.max_instances, 10);
    assert_eq!(cfg.fleet.health_check_interval_secs, 60);
    assert_eq!(cfg.tasks.max_concurrency, 8);
    assert_eq!(cfg.recovery.restart_budget, 3);
    assert_eq!(cfg.recovery.window_hours, 24);
    assert_eq!(cfg.security.level, EncryptionLevel::Standard);
    assert_eq!(cfg.security.master_key_env, "SUBFLEET_MASTER_KEY");
    assert_eq!(cfg.storage.path, "instances.db");
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("max_instances"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.fleet.max_instances, cfg.fleet.max_instances);
    assert_eq!(parsed.gateway.base_url, cfg.gateway.base_url);
    assert_eq!(parsed.security.level, cfg.security.level);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[fleet]
max_instances = 5

[security]
level = "high"
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.fleet.max_instances, 5);
    assert_eq!(cfg.security.level, EncryptionLevel::High);
    // defaults should fill in the rest
    assert_eq!(cfg.fleet.probe_timeout_secs, 10);
    assert_eq!(cfg.tasks.max_concurrency, 8);
    cfg.validate().expect("config validates");
}

#[test]
fn zero_ceiling_fails_validation() {
    let mut cfg = Config::default();
    cfg.fleet.max_instances = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("max_instances"));
}

#[test]
fn oversized_recovery_window_fails_validation() {
    let mut cfg = Config::default();
    cfg.recovery.window_hours = MAX_WINDOW_HOURS;
    assert!(cfg.validate().is_ok());
    cfg.recovery.window_hours = u64::MAX;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("window_hours"));
}

#[test]
fn zero_task_concurrency_fails_validation() {
    let mut cfg = Config::default();
    cfg.tasks.max_concurrency = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[recovery]\nrestart_budget = 7\n").unwrap();

    let cfg = Config::load_from(&path).expect("load config");
    assert_eq!(cfg.recovery.restart_budget, 7);
}

#[test]
fn load_from_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[fleet\nmax_instances = ").unwrap();
    assert!(Config::load_from(&path).is_err());
}

#[test]
fn relative_storage_path_lives_in_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config::default();
    cfg.general.data_dir = Some(dir.path().display().to_string());
    assert_eq!(cfg.storage_path(), dir.path().join("instances.db"));
}

#[test]
fn master_key_file_is_created_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys").join("master.key");

    let first = MasterKeyProvider::load_or_create(&path).expect("create key");
    assert!(path.exists());
    let second = MasterKeyProvider::load_or_create(&path).expect("reload key");
    assert_eq!(first.as_bytes(), second.as_bytes());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn corrupt_master_key_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("master.key");
    std::fs::write(&path, "not-hex").unwrap();
    assert!(MasterKeyProvider::load_or_create(&path).is_err());
}
