use clap::Parser as _;

use crate::cli::{Cli, Commands};

mod cli;
mod conf;
mod demo;
mod log;
mod util;

#[tokio::main]
async fn main() -> eyre::Result<()> {
	let cli = match Cli::try_parse() {
		Ok(v) => v,
		Err(err) => {
			println!("{:#}", err);
			return Ok(());
		}
	};

	if cli.version {
		const VER: &str = match option_env!("AETHER_OVERRIDE_VERSION") {
			Some(v) => v,
			None => env!("CARGO_PKG_VERSION"),
		};
		println!("aetherd {VER}");
		return Ok(());
	}

	if let Some(work_dir) = &cli.work_dir {
		std::env::set_current_dir(work_dir)?;
	}

	match &cli.command {
		Some(Commands::Init { format }) => {
			let format = match format {
				cli::ConfigFormat::Yaml => "yaml",
				cli::ConfigFormat::Toml => "toml",
			};
			let path = std::path::PathBuf::from(format!("config.{format}"));
			conf::PersistentConfig::default().export_to_file(&path, format)?;
			println!("wrote default configuration to {}", path.display());
			return Ok(());
		}
		Some(Commands::Demo) | None => {}
	}

	let persistent = conf::PersistentConfig::load(cli.config.clone(), cli.config_dir.clone())?;
	let runtime = conf::RuntimeConfig::from_persist(persistent);

	log::init_log(runtime.log_level)?;
	tracing::info!(target: "aether", "Aether client runtime starting");

	let received = demo::run_loopback_exchange(runtime.demo_listen_addr, &runtime.demo_messages, runtime.safe_stream).await?;

	for (sent, got) in runtime.demo_messages.iter().zip(received.iter()) {
		let got = String::from_utf8_lossy(got);
		tracing::info!(target: "aether", sent, %got, "demo message delivered");
	}

	if received.len() != runtime.demo_messages.len() {
		tracing::warn!(
			target: "aether",
			sent_count = runtime.demo_messages.len(),
			received_count = received.len(),
			"demo exchange did not deliver every message before its deadline"
		);
	}

	Ok(())
}
