use super::load_config;
use super::settings::Settings;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "0.0.0.0");
    assert_eq!(settings.server.port, 5150);
    assert_eq!(settings.broker.mem_queue_size, 10_000);
    assert_eq!(settings.broker.msg_timeout_ms, 60_000);
    assert!(settings.broker.data_path.is_none());
    assert!(settings.lookup.addresses.is_empty());
    assert_eq!(settings.log.level, "info");
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("mqd.toml");
    let toml = r#"
        [server]
        port = 9000

        [broker]
        mem_queue_size = 2
        data_path = "/var/lib/mqd"

        [lookup]
        addresses = ["10.0.0.1:5160", "10.0.0.2:5160"]
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config(Some(path.to_str().unwrap())).expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.broker.mem_queue_size, 2);
    assert_eq!(cfg.broker.data_path.as_deref(), Some("/var/lib/mqd"));
    assert_eq!(cfg.broker.max_ready_count, 2500);
    assert_eq!(cfg.lookup.addresses.len(), 2);
}

#[test]
#[serial]
fn load_config_reads_environment() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    let cfg = temp_env::with_vars(
        [
            ("MQD_BROKER__MEM_QUEUE_SIZE", Some("7")),
            ("MQD_SERVER__HOST", Some("127.0.0.1")),
            ("MQD_LOG__LEVEL", Some("debug")),
        ],
        || load_config(None),
    )
    .expect("load_config failed");

    env::set_current_dir(orig).expect("restore cwd");

    assert_eq!(cfg.broker.mem_queue_size, 7);
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.log.level, "debug");
}

#[test]
#[serial]
fn load_config_missing_explicit_file_fails() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("absent.toml");
    assert!(load_config(Some(path.to_str().unwrap())).is_err());
}
