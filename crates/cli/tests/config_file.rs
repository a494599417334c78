//! Loading configuration files from disk.

use std::fs;

use cube_cli::config::AppConfig;
use cube_cli::error::CubeError;
use tempfile::TempDir;

#[test]
fn file_values_override_defaults() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("config.json");
	fs::write(
		&path,
		r#"{
  "engine": { "workers": 8, "retry": { "maxAttempts": 5 } },
  "channel": { "url": "wss://hub.example/ws", "heartbeatIntervalMs": 10000 },
  "persistence": { "url": "http://cms.local/api" },
  "driver": { "endpoint": "tcp:127.0.0.1:19322" }
}"#,
	)
	.unwrap();

	let config = AppConfig::from_file(&path).unwrap();
	assert_eq!(config.engine.workers, 8);
	assert_eq!(config.engine.retry.max_attempts, 5);
	assert_eq!(config.engine.retry.delay_ms, 2_000);
	assert_eq!(config.channel.url, "wss://hub.example/ws");
	assert_eq!(config.channel.heartbeat_interval_ms, 10_000);
	assert_eq!(config.channel.reconnect_delay_ms, 5_000);
	assert!(config.persistence.is_enabled());
	assert_eq!(config.driver.endpoint.as_deref(), Some("tcp:127.0.0.1:19322"));
	config.validate().unwrap();
}

#[test]
fn missing_explicit_file_is_an_error() {
	let dir = TempDir::new().unwrap();
	let err = AppConfig::load(Some(&dir.path().join("absent.json"))).unwrap_err();
	assert!(matches!(err, CubeError::ConfigRead { .. }));
}

#[test]
fn malformed_file_reports_path() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("config.json");
	fs::write(&path, "{ workers: 2 }").unwrap();

	let err = AppConfig::from_file(&path).unwrap_err();
	assert!(matches!(err, CubeError::ConfigParse { .. }));
	assert!(err.to_string().contains("config.json"));
}

#[test]
fn effective_config_serializes_back_to_camel_case() {
	let value = serde_json::to_value(AppConfig::default()).unwrap();
	assert_eq!(value["channel"]["reconnectDelayMs"], 5_000);
	assert_eq!(value["engine"]["queueCapacity"], 64);
	assert_eq!(value["engine"]["stabilization"]["deepThinking"]["requiredStableReads"], 2);
	assert!(value["driver"].get("endpoint").is_none());
}
