use crate::config::AppConfig;
use crate::error::Result;

pub fn print(config: &AppConfig) -> Result<()> {
	println!("{}", serde_json::to_string_pretty(config)?);
	Ok(())
}
