// tests/ingest_config.rs
use news_ingestor::ingest::config::{load_config_default, load_config_from, ENV_CONFIG_PATH};
use news_ingestor::ingest::types::SourceKind;
use std::{env, fs};

#[test]
fn parse_toml_and_json_paths() {
    let dir = tempfile::tempdir().unwrap();

    let p_toml = dir.path().join("ingest.toml");
    fs::write(
        &p_toml,
        r#"
[[sources]]
id = "bbc"
kind = "feed"
endpoint = "https://feeds.example.com/world.xml"
"#,
    )
    .unwrap();
    let cfg = load_config_from(&p_toml).unwrap();
    assert_eq!(cfg.sources.len(), 1);
    assert_eq!(cfg.sources[0].kind, SourceKind::Feed);
    assert_eq!(cfg.sources[0].freshness_hours, 24);
    assert_eq!(cfg.delivery.batch_size, 10);

    let p_json = dir.path().join("ingest.json");
    fs::write(
        &p_json,
        r#"{"sources": [{"id": "api", "kind": "api", "endpoint": "http://x", "enabled": false}]}"#,
    )
    .unwrap();
    let cj = load_config_from(&p_json).unwrap();
    assert_eq!(cj.sources[0].kind, SourceKind::Api);
    assert_eq!(cj.enabled_sources().count(), 0);
}

#[test]
fn invalid_config_is_reported_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("broken.toml");
    fs::write(&p, "sources = 3").unwrap();
    let err = load_config_from(&p).unwrap_err();
    assert!(format!("{err:#}").contains("broken.toml"));
}

#[serial_test::serial]
#[test]
fn default_uses_env_then_fallbacks() {
    // Isolate CWD so the test never reads a real config/ directory
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();

    env::remove_var(ENV_CONFIG_PATH);

    // 1) Nothing on disk -> built-in defaults, no sources
    let cfg = load_config_default().unwrap();
    assert!(cfg.sources.is_empty());
    assert_eq!(cfg.lanes.len(), 3);

    // 2) Fallback TOML in ./config/
    let cfg_dir = tmp.path().join("config");
    fs::create_dir_all(&cfg_dir).unwrap();
    fs::write(
        cfg_dir.join("ingest.toml"),
        r#"
[[sources]]
id = "from-toml"
kind = "feed"
endpoint = "http://x"
"#,
    )
    .unwrap();
    let ct = load_config_default().unwrap();
    assert_eq!(ct.sources[0].id, "from-toml");

    // 3) ENV wins over the fallback
    let p_env = tmp.path().join("elsewhere.json");
    fs::write(
        &p_env,
        r#"{"sources": [{"id": "from-env", "kind": "api", "endpoint": "http://y"}]}"#,
    )
    .unwrap();
    env::set_var(ENV_CONFIG_PATH, p_env.display().to_string());
    let ce = load_config_default().unwrap();
    assert_eq!(ce.sources[0].id, "from-env");

    // 4) ENV pointing nowhere is an error, not a silent fallback
    env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml"));
    assert!(load_config_default().is_err());
    env::remove_var(ENV_CONFIG_PATH);

    env::set_current_dir(&old).unwrap();
}
