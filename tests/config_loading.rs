use std::io::Write;

use sopflow_core::config::AppConfig;
use sopflow_core::error::FailureKind;
use sopflow_core::sop::Backoff;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
workspace = "/tmp/sopflow-test"
max_transitions = 50
default_tool_timeout_secs = 10

[engine.default_retry]
max_attempts = 3
retryable = ["tool_io"]

[engine.default_retry.backoff]
type = "fixed"
delay_ms = 250

[approval]
timeout_secs = 3600

[store]
path = "/tmp/sopflow-test/snapshots.db"

[log]
level = 3

[[reasoners]]
name = "writer"
description = "Drafts prose"
base_url = "https://api.groq.com/openai/v1"
model = "llama-3.3-70b-versatile"
api_key = "gsk-test"
timeout_secs = 90
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_transitions, 50);
    assert_eq!(config.engine.default_tool_timeout_secs, 10);
    assert_eq!(config.engine.default_retry.max_attempts, 3);
    assert_eq!(config.engine.default_retry.retryable, vec![FailureKind::ToolIo]);
    assert_eq!(config.engine.default_retry.backoff, Backoff::fixed(250));
    assert_eq!(config.approval.timeout_secs, Some(3600));
    assert_eq!(
        config.store_path(),
        std::path::PathBuf::from("/tmp/sopflow-test/snapshots.db")
    );

    let log = config.log.as_ref().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(
        config.log_dir(),
        Some(std::path::PathBuf::from("/tmp/sopflow-test/logs"))
    );

    assert_eq!(config.reasoners.len(), 1);
    let writer = &config.reasoners[0];
    assert_eq!(writer.name, "writer");
    assert_eq!(writer.model, "llama-3.3-70b-versatile");
    assert_eq!(writer.api_key.as_deref(), Some("gsk-test"));
    assert_eq!(writer.timeout_secs, Some(90));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("SOPFLOW_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[[reasoners]]
name = "planner"
model = "test-model"
api_key = "${SOPFLOW_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.reasoners[0].api_key,
        Some("expanded-key-value".to_string())
    );
    assert_eq!(config.reasoners[0].base_url, "http://localhost:11434/v1");

    std::env::remove_var("SOPFLOW_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[engine]
workspace = "/tmp/sopflow-minimal"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_transitions, 1000);
    assert_eq!(config.engine.default_tool_timeout_secs, 30);
    assert_eq!(config.engine.default_retry.max_attempts, 1);
    assert!(matches!(
        config.engine.default_retry.backoff,
        Backoff::Exponential {
            initial_ms: 500,
            max_ms: 30_000,
            jitter: true,
            ..
        }
    ));
    assert!(config.approval.timeout_secs.is_none());
    assert!(config.log.is_none());
    assert!(config.log_dir().is_none());
    assert!(config.reasoners.is_empty());
    assert_eq!(
        config.store_path(),
        std::path::PathBuf::from("/tmp/sopflow-minimal/runs.db")
    );
}

#[test]
fn test_disabled_log_section() {
    let toml_content = r#"
[log]
enabled = false
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert!(config.log_dir().is_none());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/sopflow.toml")).unwrap_err();
    assert!(err.to_string().contains("not found"));

    let config = AppConfig::load_or_default(std::path::Path::new("/nonexistent/sopflow.toml"))
        .expect("defaults");
    assert_eq!(config.engine.max_transitions, 1000);
}
