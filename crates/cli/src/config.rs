//! Process configuration: engine tunables plus the three external endpoints.
//!
//! Loaded from a JSON file, then overridden from the environment:
//!
//! | variable | field |
//! |---|---|
//! | `CUBE_CHANNEL_URL` | `channel.url` |
//! | `CUBE_PERSISTENCE_URL` | `persistence.url` |
//! | `CUBE_DRIVER_ENDPOINT` | `driver.endpoint` |

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cube_runtime::EngineConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{CubeError, Result};

pub const CHANNEL_URL_ENV: &str = "CUBE_CHANNEL_URL";
pub const PERSISTENCE_URL_ENV: &str = "CUBE_PERSISTENCE_URL";
pub const DRIVER_ENDPOINT_ENV: &str = "CUBE_DRIVER_ENDPOINT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
	pub url: String,
	pub reconnect_delay_ms: u64,
	pub heartbeat_interval_ms: u64,
}

impl Default for ChannelConfig {
	fn default() -> Self {
		Self {
			url: "ws://127.0.0.1:8081/websocket".to_string(),
			reconnect_delay_ms: 5_000,
			heartbeat_interval_ms: 30_000,
		}
	}
}

impl ChannelConfig {
	pub fn reconnect_delay(&self) -> Duration {
		Duration::from_millis(self.reconnect_delay_ms.max(1))
	}

	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_millis(self.heartbeat_interval_ms.max(1))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceConfig {
	/// Base URL of the backend; drafts are posted to `<url>/saveDraftContent`.
	/// Empty disables persistence.
	pub url: String,
	pub timeout_ms: u64,
}

impl Default for PersistenceConfig {
	fn default() -> Self {
		Self {
			url: String::new(),
			timeout_ms: 10_000,
		}
	}
}

impl PersistenceConfig {
	pub fn is_enabled(&self) -> bool {
		!self.url.trim().is_empty()
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout_ms.max(1))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
	/// `unix:/path/to.sock`, `tcp:host:port`, or bare `host:port`.
	/// Unset means the daemon's well-known local address.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub endpoint: Option<String>,
	/// Ceiling on one daemon round trip, connect included.
	pub request_timeout_ms: u64,
}

impl Default for DriverConfig {
	fn default() -> Self {
		Self {
			endpoint: None,
			request_timeout_ms: 120_000,
		}
	}
}

impl DriverConfig {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.request_timeout_ms.max(1))
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
	pub engine: EngineConfig,
	pub channel: ChannelConfig,
	pub persistence: PersistenceConfig,
	pub driver: DriverConfig,
}

impl AppConfig {
	/// `<config dir>/cube/config.json`.
	pub fn default_path() -> Option<PathBuf> {
		dirs::config_dir().map(|dir| dir.join("cube").join("config.json"))
	}

	/// Loads `path`, or the default location when `path` is `None`, then
	/// applies environment overrides. A missing default file yields the
	/// built-in defaults; a missing explicit file is an error.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		let config = match path {
			Some(path) => Self::from_file(path)?,
			None => match Self::default_path() {
				Some(path) if path.exists() => Self::from_file(&path)?,
				_ => Self::default(),
			},
		};
		let config = config.with_env_overrides(|name| std::env::var(name).ok());
		config.validate()?;
		Ok(config)
	}

	pub fn from_file(path: &Path) -> Result<Self> {
		let raw = fs::read_to_string(path).map_err(|source| CubeError::ConfigRead {
			path: path.to_path_buf(),
			source,
		})?;
		let config = serde_json::from_str(&raw).map_err(|source| CubeError::ConfigParse {
			path: path.to_path_buf(),
			source,
		})?;
		debug!(target = "cube", path = %path.display(), "config loaded");
		Ok(config)
	}

	/// Applies overrides from `lookup`; empty values are ignored.
	pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
		let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
		if let Some(url) = lookup(CHANNEL_URL_ENV) {
			self.channel.url = url;
		}
		if let Some(url) = lookup(PERSISTENCE_URL_ENV) {
			self.persistence.url = url;
		}
		if let Some(endpoint) = lookup(DRIVER_ENDPOINT_ENV) {
			self.driver.endpoint = Some(endpoint);
		}
		self
	}

	/// Rejects endpoints that could never connect.
	pub fn validate(&self) -> Result<()> {
		let channel = Url::parse(&self.channel.url).map_err(|err| CubeError::Context(format!("channel.url {:?}: {err}", self.channel.url)))?;
		if !matches!(channel.scheme(), "ws" | "wss") {
			return Err(CubeError::Context(format!("channel.url must be ws:// or wss://, got {}", channel.scheme())));
		}
		if self.persistence.is_enabled() {
			Url::parse(&self.persistence.url).map_err(|err| CubeError::Context(format!("persistence.url {:?}: {err}", self.persistence.url)))?;
		}
		Ok(())
	}

	pub fn engine(&self) -> EngineConfig {
		self.engine.clone()
	}
}
