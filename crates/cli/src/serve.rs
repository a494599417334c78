//! Serve loop: channel frames in, routed tasks through the engine.

use std::sync::Arc;

use cube_runtime::{Engine, LiveChannel, NullPersistence, Persistence, ProviderDriver, ResultBuilder, Submission, TaskError, TaskResult};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::ChannelClient;
use crate::config::AppConfig;
use crate::driver::{DaemonDriver, DriverEndpoint};
use crate::error::Result;
use crate::persistence::HttpPersistence;
use crate::router::route_frame;

/// Persistence selected by config: HTTP when a URL is set, otherwise none.
pub fn persistence_for(config: &AppConfig) -> Result<Arc<dyn Persistence>> {
	if config.persistence.is_enabled() {
		Ok(Arc::new(HttpPersistence::new(&config.persistence)?))
	} else {
		Ok(Arc::new(NullPersistence))
	}
}

pub fn daemon_driver(config: &AppConfig) -> Result<Arc<DaemonDriver>> {
	let endpoint = DriverEndpoint::parse(config.driver.endpoint.as_deref())?;
	Ok(Arc::new(DaemonDriver::new(endpoint).with_request_timeout(config.driver.request_timeout())))
}

pub fn build_engine(config: &AppConfig, driver: Arc<dyn ProviderDriver>, channel: Arc<dyn LiveChannel>) -> Result<Engine> {
	Ok(Engine::builder(config.engine(), driver).channel(channel).persistence(persistence_for(config)?).build())
}

/// Routes one descriptor frame and waits for every task it produced.
///
/// Unroutable frames are logged and yield nothing. Rejected submissions are
/// reported to the owner as failures; deduplicated ones produce no result.
pub async fn handle_frame(engine: &Engine, raw: &str) -> Vec<TaskResult> {
	let routed = match route_frame(raw) {
		Ok(routed) => routed,
		Err(err) => {
			warn!(target = "cube", error = %err, "descriptor ignored");
			return Vec::new();
		}
	};

	let scheduler = engine.scheduler();
	let mut rejected = Vec::new();
	let mut receipts = Vec::new();
	for task in routed.tasks {
		let submitted = if routed.dedup {
			scheduler.submit_dedup(task.clone())
		} else {
			scheduler.submit(task.clone()).map(Submission::Accepted)
		};
		match submitted {
			Ok(Submission::Accepted(receipt)) => receipts.push(receipt),
			Ok(Submission::Deduplicated { task_id, in_flight }) => {
				info!(target = "cube", task_id = %task_id, in_flight = %in_flight, "duplicate descriptor skipped");
			}
			Err(err) => {
				warn!(target = "cube", task_id = %task.id, error = %err, "task rejected");
				let result = ResultBuilder::new(&task).error(&TaskError::Cancelled(err.to_string())).build();
				engine.dispatcher().deliver(&result).await;
				rejected.push(result);
			}
		}
	}

	let mut results = rejected;
	for outcome in join_all(receipts.into_iter().map(|receipt| receipt.wait())).await {
		match outcome {
			Ok(result) => results.push(result),
			Err(err) => warn!(target = "cube", error = %err, "task produced no result"),
		}
	}
	debug!(target = "cube", results = results.len(), "descriptor finished");
	results
}

/// Handles frames until the channel's inbound side closes. Each frame runs
/// on its own task so a long answer never blocks the next descriptor.
pub async fn serve_frames(engine: Arc<Engine>, mut inbound: mpsc::Receiver<String>) {
	while let Some(frame) = inbound.recv().await {
		let engine = Arc::clone(&engine);
		tokio::spawn(async move {
			handle_frame(&engine, &frame).await;
		});
	}
	debug!(target = "cube", "inbound channel closed");
}

/// Runs the engine against the configured channel until Ctrl-C.
pub async fn run(config: AppConfig) -> Result<()> {
	let driver = daemon_driver(&config)?;
	if !driver.ping().await {
		warn!(target = "cube", endpoint = %driver.endpoint(), "automation daemon not answering yet");
	}

	let parts = ChannelClient::spawn(config.channel.clone());
	let channel = Arc::clone(&parts.client);
	let engine = Arc::new(build_engine(&config, driver, Arc::clone(&channel) as Arc<dyn LiveChannel>)?);
	let maintenance = engine.spawn_maintenance();
	info!(target = "cube", url = %config.channel.url, workers = engine.config().workers, "engine running");

	tokio::select! {
		_ = serve_frames(Arc::clone(&engine), parts.inbound) => {}
		signal = tokio::signal::ctrl_c() => {
			if let Err(err) = signal {
				warn!(target = "cube", error = %err, "failed to listen for ctrl-c");
			}
			info!(target = "cube", "shutdown requested");
		}
	}

	channel.shutdown();
	maintenance.abort();
	engine.shutdown().await;
	if let Err(err) = parts.task.await {
		debug!(target = "cube.channel", error = %err, "channel task ended abnormally");
	}
	info!(target = "cube", "engine stopped");
	Ok(())
}
