use std::io::Write;

use tempfile::NamedTempFile;

use homemanager_bridge::{BridgeConfig, BridgeError, ConfigOverrides, QosLevel, SubDeviceKind};

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_file_with_cli_overrides() {
    let file = write_config(
        ".json",
        r#"{
            "broker_url": "mqtt://broker.lan:1884",
            "device_id": "hm-garage",
            "username": "bridge",
            "password": "secret",
            "qos": 2,
            "log": { "level": "debug", "console": false },
            "sub_devices": {
                "TUV": { "command_topic": "garage/tuv/set", "state_topic": "garage/tuv" }
            }
        }"#,
    );

    let cfg = BridgeConfig::load(
        Some(file.path()),
        ConfigOverrides {
            device_id: Some("hm-cellar".into()),
            qos: Some(0),
            ..ConfigOverrides::default()
        },
    )
    .expect("load config");

    assert_eq!(cfg.endpoint.host, "broker.lan");
    assert_eq!(cfg.endpoint.port, 1884);
    assert!(!cfg.endpoint.use_tls);
    assert_eq!(cfg.device_id.as_str(), "hm-cellar");
    assert_eq!(cfg.qos, QosLevel::AtMostOnce);
    assert_eq!(cfg.log_level, "debug");
    assert!(!cfg.console);

    let creds = cfg.credentials.expect("credentials");
    assert_eq!(creds.username, "bridge");
    assert_eq!(creds.password.as_deref(), Some("secret"));

    assert_eq!(cfg.bindings.len(), 1);
    let tuv = &cfg.bindings[0];
    assert_eq!(tuv.name, "TUV");
    assert_eq!(tuv.kind, SubDeviceKind::Switch);
    assert_eq!(tuv.command_topic, "garage/tuv/set");
    assert_eq!(tuv.state_topic.as_deref(), Some("garage/tuv"));
}

#[test]
fn loads_toml_file() {
    let file = write_config(
        ".toml",
        r#"
broker_url = "mqtts://broker.example.com"
device_id = "dev1"

[log]
level = "warn"

[sub_devices.WR_PSS]

[sub_devices.BOILER]
kind = "switch"
command_topic = "home/dev1/boiler/cmd"
state_topic = "home/dev1/boiler/state"
"#,
    );

    let cfg = BridgeConfig::load(Some(file.path()), ConfigOverrides::default()).expect("load");
    assert!(cfg.endpoint.use_tls);
    assert_eq!(cfg.endpoint.port, 8883);
    assert_eq!(cfg.log_level, "warn");

    let names: Vec<&str> = cfg.bindings.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["BOILER", "WR_PSS"]);
    assert_eq!(cfg.bindings[1].kind, SubDeviceKind::Reading);
    assert_eq!(cfg.bindings[1].command_topic, "home/dev1/WR_PSS/cmd");
    assert_eq!(cfg.bindings[1].state_topic, None);
}

#[test]
fn default_bindings_use_device_id() {
    let cfg = BridgeConfig::from_overrides(ConfigOverrides {
        device_id: Some("dev7".into()),
        ..ConfigOverrides::default()
    })
    .expect("load");

    let topics: Vec<(&str, &str, Option<&str>)> = cfg
        .bindings
        .iter()
        .map(|b| {
            (
                b.name.as_str(),
                b.command_topic.as_str(),
                b.state_topic.as_deref(),
            )
        })
        .collect();
    assert_eq!(
        topics,
        vec![
            ("WR_PSS", "home/dev7/WR_PSS/cmd", None),
            ("TUV", "home/dev7/TUV/cmd", Some("home/dev7/TUV/state")),
        ]
    );
}

#[test]
fn rejects_invalid_values() {
    let cases = [
        ConfigOverrides {
            qos: Some(3),
            ..ConfigOverrides::default()
        },
        ConfigOverrides {
            device_id: Some("home/dev1".into()),
            ..ConfigOverrides::default()
        },
        ConfigOverrides {
            broker_url: Some("http://broker:80".into()),
            ..ConfigOverrides::default()
        },
    ];
    for overrides in cases {
        let err = BridgeConfig::from_overrides(overrides).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)), "{err}");
    }
}

#[test]
fn rejects_conflicting_topics_in_file() {
    let file = write_config(
        ".json",
        r#"{
            "sub_devices": {
                "WR_PSS": { "command_topic": "home/shared" },
                "TUV": { "command_topic": "home/tuv/cmd", "state_topic": "home/shared" }
            }
        }"#,
    );
    let err = BridgeConfig::load(Some(file.path()), ConfigOverrides::default()).unwrap_err();
    assert!(err.to_string().contains("also a command topic"));
}

#[test]
fn rejects_unknown_fields_and_missing_file() {
    let file = write_config(".json", r#"{ "brokr_url": "tcp://x" }"#);
    let err = BridgeConfig::load(Some(file.path()), ConfigOverrides::default()).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.json");
    let err = BridgeConfig::load(Some(&missing), ConfigOverrides::default()).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}

#[test]
fn tls_paths_are_loaded_into_endpoint() {
    let ca = write_config(".pem", "-----BEGIN CERTIFICATE-----\n");
    let cfg = BridgeConfig::from_overrides(ConfigOverrides {
        broker_url: Some("ssl://broker:8884".into()),
        tls_ca: Some(ca.path().to_path_buf()),
        ..ConfigOverrides::default()
    })
    .expect("load");
    assert!(cfg.endpoint.use_tls);
    assert!(cfg.endpoint.tls.ca.is_some());

    let err = BridgeConfig::from_overrides(ConfigOverrides {
        tls_client_cert: Some(ca.path().to_path_buf()),
        ..ConfigOverrides::default()
    })
    .unwrap_err();
    assert!(err.to_string().contains("without key"));
}

#[test]
fn lockout_topics_from_file() {
    let file = write_config(
        ".toml",
        r#"
[sub_devices.TUV]
lockout = true

[sub_devices.PUMP]
kind = "switch"
command_topic = "hm/pump/set"
state_topic = "hm/pump"
lockout_command_topic = "hm/pump/lock/set"
lockout_state_topic = "hm/pump/lock"
"#,
    );
    let cfg = BridgeConfig::load(
        Some(file.path()),
        ConfigOverrides {
            device_id: Some("dev1".into()),
            ..ConfigOverrides::default()
        },
    )
    .expect("load");

    let pump = cfg.bindings.iter().find(|b| b.name == "PUMP").unwrap();
    let lockout = pump.lockout.as_ref().expect("pump lockout");
    assert_eq!(lockout.command_topic, "hm/pump/lock/set");
    assert_eq!(lockout.state_topic, "hm/pump/lock");

    let tuv = cfg.bindings.iter().find(|b| b.name == "TUV").unwrap();
    let lockout = tuv.lockout.as_ref().expect("tuv lockout");
    assert_eq!(lockout.command_topic, "home/dev1/TUV/state/disable/set");
    assert_eq!(lockout.state_topic, "home/dev1/TUV/state/disable");
}

#[test]
fn lockout_needs_a_switch_and_both_topics() {
    let reading = write_config(".toml", "[sub_devices.WR_PSS]\nlockout = true\n");
    let err = BridgeConfig::load(Some(reading.path()), ConfigOverrides::default()).unwrap_err();
    assert!(err.to_string().contains("no state topic"), "{err}");

    let half = write_config(
        ".toml",
        "[sub_devices.TUV]\nlockout_command_topic = \"hm/tuv/lock/set\"\n",
    );
    let err = BridgeConfig::load(Some(half.path()), ConfigOverrides::default()).unwrap_err();
    assert!(err.to_string().contains("both lockout topics"), "{err}");
}
