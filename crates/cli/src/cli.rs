use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cube")]
#[command(about = "Cube task engine - drives AI providers through their web UI")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Configuration file (defaults to <config dir>/cube/config.json)
	#[arg(long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Connect to the event channel and serve task descriptors until Ctrl-C
	Run,

	/// Run one task descriptor against the automation daemon and print the results
	Submit {
		/// Descriptor JSON, e.g. '{"userId":"u1","userPrompt":"hi","roles":"deepseek"}'
		#[arg(long, short)]
		input: String,
	},

	/// Print the effective configuration
	Config,
}
