use serde_json::json;
use templink_client::config::{ClientConfig, ConfigError};

const VALID: &str = r#"
ws_endpoint = "ws://homeassistant.local:8123/api/websocket"
access_token = "secret"
user = "alice"
locale = "en-GB"

[device]
path = "/var/lib/templink/device.json"

[reconnect]
initial_ms = 500
max_ms = 30000
multiplier = 2.0
jitter_ms = 250

[[watch]]
name = "porch"
template = "{{ states(entity) }}"
variables = { entity = "light.porch", brightness = 80 }

[[watch]]
name = "motd"
template = "Welcome home"
"#;

fn parse(contents: &str) -> ClientConfig {
    ClientConfig::parse(contents).expect("config should parse")
}

fn invalid_field(result: Result<(), ConfigError>) -> &'static str {
    match result {
        Err(ConfigError::InvalidValue { field, .. }) => field,
        other => panic!("expected InvalidValue, got {other:?}"),
    }
}

#[test]
fn test_valid_config_loads() {
    let config = parse(VALID);
    config.validate().unwrap();

    assert_eq!(config.user, "alice");
    assert_eq!(config.view, "");
    assert!(config.device.id_override.is_none());
    assert_eq!(config.watches.len(), 2);

    let vars = config.watches[0].variables().unwrap();
    assert_eq!(vars.get("entity"), Some(&json!("light.porch")));
    assert_eq!(vars.get("brightness"), Some(&json!(80)));
    assert!(config.watches[1].variables().unwrap().is_empty());
}

#[test]
fn test_from_path_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("templink.toml");
    std::fs::write(&path, VALID).unwrap();

    let config = ClientConfig::from_path(&path).unwrap();
    assert_eq!(config.access_token, "secret");
}

#[test]
fn test_unknown_fields_are_rejected() {
    let contents = VALID.replace("user = \"alice\"", "user = \"alice\"\ncolour = \"red\"");
    assert!(matches!(
        ClientConfig::parse(&contents),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_missing_required_field_is_rejected() {
    let contents = VALID.replace("access_token = \"secret\"\n", "");
    assert!(ClientConfig::parse(&contents).is_err());
}

#[test]
fn test_endpoint_scheme_is_checked() {
    let config = parse(&VALID.replace("ws://", "http://"));
    assert_eq!(invalid_field(config.validate()), "ws_endpoint");
}

#[test]
fn test_reconnect_bounds_are_checked() {
    let config = parse(&VALID.replace("max_ms = 30000", "max_ms = 100"));
    assert_eq!(invalid_field(config.validate()), "reconnect.max_ms");

    let config = parse(&VALID.replace("multiplier = 2.0", "multiplier = 0.5"));
    assert_eq!(invalid_field(config.validate()), "reconnect.multiplier");
}

#[test]
fn test_non_finite_multiplier_is_rejected() {
    for value in ["nan", "inf", "+inf"] {
        let config = parse(&VALID.replace("multiplier = 2.0", &format!("multiplier = {value}")));
        assert_eq!(
            invalid_field(config.validate()),
            "reconnect.multiplier",
            "multiplier = {value}"
        );
    }
}

#[test]
fn test_duplicate_watch_names_are_rejected() {
    let config = parse(&VALID.replace("name = \"motd\"", "name = \"porch\""));
    assert_eq!(invalid_field(config.validate()), "watch.name");
}

#[test]
fn test_device_override_must_be_an_id() {
    let contents = VALID.replace(
        "path = \"/var/lib/templink/device.json\"",
        "path = \"/var/lib/templink/device.json\"\nid_override = \"two words\"",
    );
    let config = parse(&contents);
    assert_eq!(invalid_field(config.validate()), "device.id_override");
}
