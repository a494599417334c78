mod show_config;
mod submit;

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::error::Result;
use crate::serve;

pub async fn dispatch(cli: Cli) -> Result<()> {
	let config = AppConfig::load(cli.config.as_deref())?;

	match cli.command {
		Commands::Run => serve::run(config).await?,
		Commands::Submit { input } => submit::run(config, &input).await?,
		Commands::Config => show_config::print(&config)?,
	}

	Ok(())
}
