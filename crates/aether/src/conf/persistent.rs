use std::{net::SocketAddr, path::PathBuf, time::Duration};

use educe::Educe;
use figment::{
	Figment,
	providers::{Env, Format, Toml, Yaml},
};
use serde::{Deserialize, Serialize};

/// On-disk shape of the daemon's configuration (`spec.md` §6 "Configuration"
/// — the `AE_*` compile-time switches there become runtime-tunable fields
/// here, since this rewrite has no separate `config.h` build step). Grounded
/// on `wind::conf::persistent::PersistentConfig`'s figment+educe loading
/// idiom.
#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct PersistentConfig {
	pub log: LogOpt,
	pub safe_stream: SafeStreamOpt,
	pub server_connection: ServerConnectionOpt,
	pub demo: DemoOpt,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct LogOpt {
	#[educe(Default = "info")]
	pub level: String,
}

/// Maps onto `aether_stream::SafeStreamConfig` (`spec.md` §3
/// `SafeStreamConfig`, §6 `AE_SAFE_STREAM_RTO_GROW_FACTOR`).
#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct SafeStreamOpt {
	#[educe(Default = 256)]
	pub buffer_capacity: usize,

	#[educe(Default = 5)]
	pub max_repeat_count: u32,

	#[educe(Default = 1200)]
	pub max_data_size: usize,

	#[educe(Default = 100)]
	pub window_size: usize,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_millis(10_000)))]
	pub wait_confirm_timeout: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_millis(200)))]
	pub send_confirm_timeout: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_millis(300)))]
	pub send_repeat_timeout: Duration,

	#[educe(Default = 1.5)]
	pub rto_grow_factor: f64,
}

/// Maps onto `aether_client::ServerConnectionManagerConfig` (`spec.md` §6
/// `AE_CLOUD_MAX_SERVER_CONNECTIONS`, `AE_PING_INTERVAL_MS`).
#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct ServerConnectionOpt {
	#[educe(Default = 3)]
	pub max_connections: usize,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_millis(5_000)))]
	pub ping_interval: Duration,

	#[educe(Default = 3)]
	pub connect_failure_threshold: u32,

	#[educe(Default = 2)]
	pub ping_timeout_multiplier: u32,
}

/// The `demo` subcommand's wiring: a loopback TCP listener/dialer pair
/// exercising C4→C6→C7 end to end without a real server (`spec.md` §1
/// "Server-side implementation" is explicitly out of scope).
#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct DemoOpt {
	#[educe(Default(expression = "127.0.0.1:0".parse().unwrap()))]
	pub listen_addr: SocketAddr,

	#[educe(Default(expression = vec![String::from("hello from aether")]))]
	pub messages: Vec<String>,
}

impl PersistentConfig {
	pub fn export_to_file(&self, file_path: &PathBuf, format: &str) -> eyre::Result<()> {
		use std::{fs, io::Write};

		match format.to_lowercase().as_str() {
			"yaml" => {
				let yaml_content = serde_yaml::to_string(&self)?;
				let mut file = fs::File::create(file_path)?;
				file.write_all(yaml_content.as_bytes())?;
			}
			"toml" => {
				let toml_content = toml::to_string_pretty(&self)?;
				let mut file = fs::File::create(file_path)?;
				file.write_all(toml_content.as_bytes())?;
			}
			_ => return Err(eyre::eyre!("Unsupported file format: {}", format)),
		}

		Ok(())
	}

	pub fn load(config_path: Option<String>, config_dir: Option<PathBuf>) -> eyre::Result<Self> {
		let mut figment = Figment::new();

		if let Some(config_dir) = config_dir {
			let config_file = config_dir.join("config.toml");
			if config_file.exists() {
				figment = figment.merge(Toml::file(config_file));
			}

			let config_file = config_dir.join("config.yaml");
			if config_file.exists() {
				figment = figment.merge(Yaml::file(config_file));
			}
		} else {
			let config_toml = std::path::Path::new("config.toml");
			if config_toml.exists() {
				figment = figment.merge(Toml::file(config_toml));
			}

			let config_yaml = std::path::Path::new("config.yaml");
			if config_yaml.exists() {
				figment = figment.merge(Yaml::file(config_yaml));
			}
		}

		if let Some(config_path) = config_path {
			if config_path.ends_with(".toml") {
				figment = figment.merge(Toml::file(config_path));
			} else if config_path.ends_with(".yaml") || config_path.ends_with(".yml") {
				figment = figment.merge(Yaml::file(config_path));
			} else {
				figment = figment.merge(Toml::file(config_path));
			}
		}

		figment = figment.merge(Env::prefixed("AETHER_"));

		let config: PersistentConfig = figment.extract()?;
		Ok(config)
	}
}
