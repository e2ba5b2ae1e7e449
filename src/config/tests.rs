use super::settings::Settings;
use super::{load_config, load_config_from};
use serial_test::serial;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.login, "guest");
    assert_eq!(settings.broker.host, "localhost");
    assert_eq!(settings.broker.port, 5672);
    assert_eq!(settings.broker.virtual_host, "/");
    assert!(!settings.broker.ssl);
    assert!(settings.broker.ca_certs.is_none());
    assert_eq!(settings.consumer.prefetch_count, 1);
    assert_eq!(settings.log.level, "info");
}

#[test]
#[serial]
fn test_load_config_without_sources_uses_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let missing = tmp.path().join("nothing-here");

    let cfg = temp_env::with_vars_unset(["MQ__BROKER__HOST", "MQ__BROKER__PORT"], || {
        load_config_from(missing.to_str().unwrap())
    })
    .expect("load_config failed");

    assert_eq!(cfg.broker.host, "localhost");
    assert_eq!(cfg.broker.port, 5672);
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let file = tmp.path().join("agent.toml");
    let toml = r#"
        [broker]
        login = "murano"
        password = "secret"
        host = "mq.internal"
        port = 5671
        virtual_host = "agents"
        ssl = true
        ca_certs = "/etc/ssl/mq-ca.pem"

        [consumer]
        prefetch_count = 4
    "#;
    fs::write(&file, toml).expect("write config file");

    let cfg = load_config_from(file.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.broker.login, "murano");
    assert_eq!(cfg.broker.password, "secret");
    assert_eq!(cfg.broker.host, "mq.internal");
    assert_eq!(cfg.broker.port, 5671);
    assert_eq!(cfg.broker.virtual_host, "agents");
    assert!(cfg.broker.ssl);
    assert_eq!(
        cfg.broker.ca_certs,
        Some(PathBuf::from("/etc/ssl/mq-ca.pem"))
    );
    assert_eq!(cfg.consumer.prefetch_count, 4);
    // untouched sections keep their defaults
    assert_eq!(cfg.log.level, "info");
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = std::env::current_dir().expect("current_dir");
    std::env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    fs::write("config/default.toml", "[broker]\nhost = \"from-file\"\n")
        .expect("write config file");

    let cfg = temp_env::with_vars(
        [
            ("MQ__BROKER__HOST", Some("from-env")),
            ("MQ__BROKER__PORT", Some("5673")),
        ],
        load_config,
    );

    std::env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.broker.host, "from-env");
    assert_eq!(cfg.broker.port, 5673);
}
