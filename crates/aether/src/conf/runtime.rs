use std::{net::SocketAddr, str::FromStr};

use aether_client::ServerConnectionManagerConfig;
use aether_stream::SafeStreamConfig;
use tracing::Level;

/// Resolved configuration the rest of the binary consumes — persistent
/// fields translated into the concrete types the engine crates expect
/// (`wind::conf::runtime::Config::from_persist`'s role, generalized from a
/// single SOCKS/TUIC pairing to the engine's safe-stream and
/// server-connection tunables).
pub struct RuntimeConfig {
	pub log_level: Level,
	pub safe_stream: SafeStreamConfig,
	pub server_connection: ServerConnectionManagerConfig,
	pub demo_listen_addr: SocketAddr,
	pub demo_messages: Vec<String>,
}

impl RuntimeConfig {
	pub fn from_persist(config: super::persistent::PersistentConfig) -> Self {
		Self {
			log_level: Level::from_str(&config.log.level).unwrap_or(Level::INFO),
			safe_stream: SafeStreamConfig {
				buffer_capacity: config.safe_stream.buffer_capacity,
				max_repeat_count: config.safe_stream.max_repeat_count,
				max_data_size: config.safe_stream.max_data_size,
				window_size: config.safe_stream.window_size,
				wait_confirm_timeout: config.safe_stream.wait_confirm_timeout,
				send_confirm_timeout: config.safe_stream.send_confirm_timeout,
				send_repeat_timeout: config.safe_stream.send_repeat_timeout,
				rto_grow_factor: config.safe_stream.rto_grow_factor,
			},
			server_connection: ServerConnectionManagerConfig {
				max_connections: config.server_connection.max_connections,
				ping_interval: config.server_connection.ping_interval,
				connect_failure_threshold: config.server_connection.connect_failure_threshold,
				ping_timeout_multiplier: config.server_connection.ping_timeout_multiplier,
			},
			demo_listen_addr: config.demo.listen_addr,
			demo_messages: config.demo.messages,
		}
	}
}
