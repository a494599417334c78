//! HTTP client for the draft persistence backend.

use async_trait::async_trait;
use cube_protocol::{DraftRecord, SAVE_DRAFT_PATH};
use cube_runtime::{DispatchError, Persistence};
use tracing::debug;

use crate::config::PersistenceConfig;
use crate::error::CubeError;

#[derive(Debug, Clone)]
pub struct HttpPersistence {
	client: reqwest::Client,
	endpoint: String,
}

impl HttpPersistence {
	pub fn new(config: &PersistenceConfig) -> Result<Self, CubeError> {
		let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
		Ok(Self {
			client,
			endpoint: format!("{}{SAVE_DRAFT_PATH}", config.url.trim_end_matches('/')),
		})
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}
}

#[async_trait]
impl Persistence for HttpPersistence {
	async fn save_draft(&self, record: DraftRecord) -> Result<(), DispatchError> {
		let response = self
			.client
			.post(&self.endpoint)
			.json(&record)
			.send()
			.await
			.map_err(|err| DispatchError::Persistence(err.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(DispatchError::Persistence(format!("{status}: {body}")));
		}
		debug!(target = "cube.dispatch", endpoint = %self.endpoint, user_id = %record.user_id, "draft saved");
		Ok(())
	}
}
