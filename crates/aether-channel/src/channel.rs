//! Channel layer (`spec.md` §3, §4.4): the (endpoint, adapter) pair with
//! fixed transport properties and rolling connect/response-time statistics.
//! Grounded on `original_source/aether/channels/channel.h`.

use std::{
	net::IpAddr,
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use aether_core::{
	stats::StatisticsCounter,
	stream::ByteStream,
	types::{Address, AddressPort, Endpoint, UnifiedAddress},
};
use futures::future::BoxFuture;

use crate::{
	access_point::{AccessPoint, DEFAULT_CONNECTION_TIMEOUT},
	adapter::Adapter,
	error::{ChannelResult, ConfigurationSnafu, ResolveSnafu},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
	Full,
	Less,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
	Reliable,
	Unreliable,
}

/// `spec.md` §3 `ChannelTransportProperties`, fixed once a [`Channel`] is
/// constructed (`spec.md`'s invariant: "A Channel's transport properties are
/// fixed once set").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTransportProperties {
	pub max_packet_size: u32,
	pub rec_packet_size: u32,
	pub connection_type: ConnectionType,
	pub reliability: Reliability,
}

/// Lazy DNS resolution collaborator (`spec.md` §3 `UnifiedAddress`, §4.4
/// phase 2 "Resolve"). Out of `spec.md` §1's scope beyond this interface.
pub trait Resolver: Send + Sync {
	fn resolve(&self, name: &str) -> BoxFuture<'static, ChannelResult<Vec<IpAddr>>>;
}

/// Instantiates the concrete C4 driver for an endpoint (`spec.md` §4.4 phase
/// 3 "Create transport"). One implementation per [`aether_core::types::Protocol`]
/// the adapter supports; TCP/UDP build directly against `aether_transport`,
/// modem/LoRa close over an injected hardware driver.
pub trait TransportFactory: Send + Sync {
	fn build(&self, endpoint: &Endpoint) -> BoxFuture<'static, ChannelResult<Box<dyn ByteStream>>>;
}

/// The (endpoint, adapter) pair plus its transport properties and rolling
/// statistics (`spec.md` §3 `Channel`).
pub struct Channel {
	address: UnifiedAddress,
	adapter: Arc<Adapter>,
	access_point: Arc<AccessPoint>,
	properties: ChannelTransportProperties,
	connect_time: Mutex<StatisticsCounter<Duration>>,
	response_time: Mutex<StatisticsCounter<Duration>>,
}

impl Channel {
	pub fn new(
		endpoint: Endpoint,
		adapter: Arc<Adapter>,
		access_point: Arc<AccessPoint>,
		properties: ChannelTransportProperties,
		connect_window: usize,
		response_window: usize,
	) -> Arc<Self> {
		let address = match &endpoint.address_port.address {
			Address::Named(_) => UnifiedAddress::Unresolved(endpoint),
			_ => UnifiedAddress::Resolved(endpoint),
		};
		Arc::new(Self {
			address,
			adapter,
			access_point,
			properties,
			connect_time: Mutex::new(StatisticsCounter::new(connect_window.max(1))),
			response_time: Mutex::new(StatisticsCounter::new(response_window.max(1))),
		})
	}

	pub fn properties(&self) -> ChannelTransportProperties {
		self.properties
	}

	pub fn adapter(&self) -> &Arc<Adapter> {
		&self.adapter
	}

	pub fn endpoint(&self) -> &Endpoint {
		self.address.endpoint()
	}

	pub fn record_connect_time(&self, elapsed: Duration) {
		self.connect_time.lock().unwrap().push(elapsed);
	}

	pub fn record_response_time(&self, elapsed: Duration) {
		self.response_time.lock().unwrap().push(elapsed);
	}

	pub fn connect_time_p99(&self) -> Option<Duration> {
		self.connect_time.lock().unwrap().percentile(99)
	}

	pub fn response_time_p99(&self) -> Option<Duration> {
		self.response_time.lock().unwrap().percentile(99)
	}

	/// `spec.md` §4.4: "`TransportBuildTimeout()` defaults to
	/// `connect_time_p99 + 5s` (LoRa) or `connect_time_p99` (others) with a
	/// floor of `AE_DEFAULT_CONNECTION_TIMEOUT_MS` until enough samples
	/// exist."
	pub fn transport_build_timeout(&self, is_lora: bool) -> Duration {
		let base = match self.connect_time_p99() {
			Some(p99) if is_lora => p99 + Duration::from_secs(5),
			Some(p99) => p99,
			None => DEFAULT_CONNECTION_TIMEOUT,
		};
		base.max(DEFAULT_CONNECTION_TIMEOUT)
	}

	/// The multi-phase build described by `spec.md` §4.4: connect the
	/// access-point, resolve the endpoint if named, instantiate the
	/// transport, then await `link_state = linked`. Concurrency dedup across
	/// repeated callers while a build is already running is left to the
	/// caller (`spec.md` §3's "Only one transport-builder per Channel may be
	/// in progress at a time" is enforced the same way `AccessPoint::connect`
	/// dedups — callers that need it share one `Shared` future, see
	/// `aether-client::server` for the pool-level usage).
	pub async fn transport_builder(
		self: &Arc<Self>,
		resolver: &dyn Resolver,
		factory: &dyn TransportFactory,
	) -> ChannelResult<Box<dyn ByteStream>> {
		let start = Instant::now();

		// Phase 1: connect access-point.
		self.access_point.connect().await?;
		self.adapter.set_active(self.access_point.clone());

		// Phase 2: resolve if Named.
		let endpoint = self.resolved_endpoint(resolver).await?;

		// Phase 3: create transport.
		let stream = factory.build(&endpoint).await?;

		// Phase 4: await link (the caller subscribes to `stream_update_event`
		// and tears the stream down on `link-error`; the factories in this
		// crate already wait for `Linked`/`LinkError` internally before
		// resolving, so by the time we get here the link state is final).
		self.record_connect_time(start.elapsed());
		Ok(stream)
	}

	async fn resolved_endpoint(&self, resolver: &dyn Resolver) -> ChannelResult<Endpoint> {
		let endpoint = self.address.endpoint().clone();
		if !self.address.needs_resolution() {
			return Ok(endpoint);
		}
		let Address::Named(name) = &endpoint.address_port.address else {
			return Ok(endpoint);
		};
		let ips = resolver.resolve(name).await?;
		let Some(ip) = ips.into_iter().next() else {
			return ResolveSnafu {
				name: name.clone(),
				reason: "resolver returned no addresses",
			}
			.fail();
		};
		let address = match ip {
			IpAddr::V4(v4) => Address::IPv4(v4),
			IpAddr::V6(v6) => Address::IPv6(v6),
		};
		Ok(Endpoint {
			address_port: AddressPort {
				address,
				port: endpoint.address_port.port,
			},
			protocol: endpoint.protocol,
		})
	}
}

/// A [`Resolver`] that accepts only already-numeric addresses and reports
/// every `Named` lookup as a configuration error — the default for builds
/// without `AE_SUPPORT_CLOUD_DNS` (`spec.md` §6 configuration table).
pub struct NoDnsResolver;

impl Resolver for NoDnsResolver {
	fn resolve(&self, name: &str) -> BoxFuture<'static, ChannelResult<Vec<IpAddr>>> {
		let name = name.to_string();
		Box::pin(async move {
			ConfigurationSnafu {
				protocol: format!("DNS resolution of {name} (AE_SUPPORT_CLOUD_DNS disabled)"),
			}
			.fail()
		})
	}
}

#[cfg(test)]
mod test {
	use std::net::Ipv4Addr;

	use aether_core::{stream::LoopbackStream, types::Protocol};

	use super::*;
	use crate::access_point::AccessPointDriver;

	struct NoopDriver;
	impl AccessPointDriver for NoopDriver {
		fn connect(&self) -> BoxFuture<'static, Result<(), String>> {
			Box::pin(async { Ok(()) })
		}
	}

	struct LoopbackFactory;
	impl TransportFactory for LoopbackFactory {
		fn build(&self, _endpoint: &Endpoint) -> BoxFuture<'static, ChannelResult<Box<dyn ByteStream>>> {
			Box::pin(async { Ok(Box::new(LoopbackStream::pair().0) as Box<dyn ByteStream>) })
		}
	}

	fn test_channel() -> Arc<Channel> {
		let ap = AccessPoint::new(1, Arc::new(NoopDriver));
		let adapter = Adapter::new(1, vec![ap.clone()]);
		let endpoint = Endpoint {
			address_port: AddressPort {
				address: Address::IPv4(Ipv4Addr::LOCALHOST),
				port: 4000,
			},
			protocol: Protocol::Tcp,
		};
		Channel::new(
			endpoint,
			adapter,
			ap,
			ChannelTransportProperties {
				max_packet_size: 1500,
				rec_packet_size: 1400,
				connection_type: ConnectionType::Full,
				reliability: Reliability::Reliable,
			},
			100,
			100,
		)
	}

	#[tokio::test]
	async fn transport_builder_succeeds_and_records_connect_time() {
		let channel = test_channel();
		let stream = channel.transport_builder(&NoDnsResolver, &LoopbackFactory).await.unwrap();
		assert_eq!(stream.info().link_state, aether_core::stream::LinkState::Linked);
		assert_eq!(channel.connect_time.lock().unwrap().len(), 1);
	}

	#[test]
	fn timeout_floor_applies_with_no_samples() {
		let channel = test_channel();
		assert_eq!(channel.transport_build_timeout(false), DEFAULT_CONNECTION_TIMEOUT);
	}

	#[test]
	fn lora_timeout_adds_five_seconds_over_p99() {
		let channel = test_channel();
		for _ in 0..10 {
			channel.record_connect_time(Duration::from_millis(60_000));
		}
		assert_eq!(channel.transport_build_timeout(true), Duration::from_millis(65_000));
	}
}
