use std::sync::Arc;

use anyhow::{Context, anyhow};
use cube_runtime::{LiveChannel, MemoryChannel};
use tracing::info;

use crate::config::AppConfig;
use crate::error::Result;
use crate::router::route_frame;
use crate::serve::{build_engine, daemon_driver, handle_frame};

/// Runs one descriptor end to end and prints the results as JSON.
///
/// Outbound messages are collected in memory instead of a live channel and
/// printed alongside the results.
pub async fn run(config: AppConfig, input: &str) -> Result<()> {
	let routed = route_frame(input)?;
	info!(target = "cube", tasks = routed.tasks.len(), "descriptor accepted");

	let driver = daemon_driver(&config)?;
	if !driver.ping().await {
		return Err(anyhow!("automation daemon not reachable at {}", driver.endpoint()).into());
	}

	let channel = Arc::new(MemoryChannel::new());
	let engine = build_engine(&config, driver, Arc::clone(&channel) as Arc<dyn LiveChannel>)?;
	let results = handle_frame(&engine, input).await;
	engine.shutdown().await;
	info!(target = "cube", results = results.len(), "submission finished");

	let output = serde_json::json!({
		"results": results,
		"messages": channel.take(),
	});
	let rendered = serde_json::to_string_pretty(&output).context("Failed to render results")?;
	println!("{rendered}");
	Ok(())
}
