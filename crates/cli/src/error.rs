use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CubeError {
	#[error("failed to read config {path}: {source}")]
	ConfigRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("invalid config {path}: {source}")]
	ConfigParse {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("invalid task descriptor: {0}")]
	Descriptor(String),

	#[error("event channel error: {0}")]
	Channel(String),

	#[error("persistence error: {0}")]
	Persistence(#[from] reqwest::Error),

	#[error("automation daemon error: {0}")]
	Daemon(String),

	#[error("{0}")]
	Context(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CubeError>;
