//! Collector binary: loads configuration, builds a `Core`, and runs it to
//! completion or until an OS interrupt arrives.

use std::{fs, path::PathBuf};

use clap::Parser;
use pgwatch3_collector::{config::CollectorConfig, core::Core, Error, Result};
use tokio_util::sync::CancellationToken;

/// Command-line arguments for the collector binary.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
	/// Path to the YAML collector configuration.
	#[arg(long)]
	config: PathBuf,

	/// Passphrase used to decrypt envelope-encrypted endpoint passwords.
	/// Mutually exclusive with `--decryption-key-file`.
	#[arg(long, env = "PGWATCH3_DECRYPTION_KEY")]
	decryption_key: Option<String>,

	/// Path to a file containing the decryption passphrase.
	#[arg(long)]
	decryption_key_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

	let args = Args::parse();
	let config_text = fs::read_to_string(&args.config)?;
	let config = CollectorConfig::from_yaml(&config_text)?;
	let decryption_key = load_decryption_key(&args)?;
	let core = Core::new(&config, decryption_key)?;

	let cancel = CancellationToken::new();
	let shutdown = cancel.clone();

	tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;

		shutdown.cancel();
	});

	core.run(cancel).await;

	Ok(())
}

fn load_decryption_key(args: &Args) -> Result<Vec<u8>> {
	if let Some(key) = &args.decryption_key {
		return Ok(key.as_bytes().to_vec());
	}

	if let Some(path) = &args.decryption_key_file {
		return Ok(fs::read_to_string(path)?.trim_end().as_bytes().to_vec());
	}

	Err(Error::Config(
		"no decryption key supplied: pass --decryption-key, $PGWATCH3_DECRYPTION_KEY, or --decryption-key-file".into(),
	))
}
