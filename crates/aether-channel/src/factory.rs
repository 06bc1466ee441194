//! Concrete [`TransportFactory`] implementations, one per `spec.md` §4.3
//! driver, wiring `aether-transport`'s drivers behind the channel layer's
//! "create transport" phase (`spec.md` §4.4 phase 3).

use std::{net::SocketAddr, sync::Arc};

use aether_core::{
	stream::ByteStream,
	types::{Address, Endpoint, Protocol},
};
use aether_transport::{LoraDriver, LoraTransport, ModemDriver, ModemTransport, TcpTransport, UdpTransport};
use futures::future::BoxFuture;
use snafu::ResultExt;

use crate::{
	channel::TransportFactory,
	error::{ChannelResult, ConfigurationSnafu, TransportSnafu},
};

fn socket_addr(endpoint: &Endpoint) -> ChannelResult<SocketAddr> {
	let ip = match &endpoint.address_port.address {
		Address::IPv4(ip) => std::net::IpAddr::V4(*ip),
		Address::IPv6(ip) => std::net::IpAddr::V6(*ip),
		Address::Named(name) => {
			return ConfigurationSnafu {
				protocol: format!("unresolved named address {name} reached the transport factory"),
			}
			.fail();
		}
	};
	Ok(SocketAddr::new(ip, endpoint.address_port.port))
}

/// Builds [`TcpTransport`]s (`spec.md` §4.3 "TCP transport").
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
	fn build(&self, endpoint: &Endpoint) -> BoxFuture<'static, ChannelResult<Box<dyn ByteStream>>> {
		let endpoint = endpoint.clone();
		Box::pin(async move {
			if endpoint.protocol != Protocol::Tcp {
				return ConfigurationSnafu {
					protocol: format!("{:?} given to the TCP transport factory", endpoint.protocol),
				}
				.fail();
			}
			let addr = socket_addr(&endpoint)?;
			Ok(Box::new(TcpTransport::connect(addr)) as Box<dyn ByteStream>)
		})
	}
}

/// Builds [`UdpTransport`]s (`spec.md` §4.3 "UDP transport").
pub struct UdpTransportFactory;

impl TransportFactory for UdpTransportFactory {
	fn build(&self, endpoint: &Endpoint) -> BoxFuture<'static, ChannelResult<Box<dyn ByteStream>>> {
		let endpoint = endpoint.clone();
		Box::pin(async move {
			if endpoint.protocol != Protocol::Udp {
				return ConfigurationSnafu {
					protocol: format!("{:?} given to the UDP transport factory", endpoint.protocol),
				}
				.fail();
			}
			let addr = socket_addr(&endpoint)?;
			let transport = UdpTransport::connect(addr).await.context(TransportSnafu)?;
			Ok(Box::new(transport) as Box<dyn ByteStream>)
		})
	}
}

/// Builds [`ModemTransport`]s over an injected [`ModemDriver`] (`spec.md`
/// §4.3 "Modem transport").
pub struct ModemTransportFactory {
	pub driver: Arc<dyn ModemDriver>,
}

impl TransportFactory for ModemTransportFactory {
	fn build(&self, endpoint: &Endpoint) -> BoxFuture<'static, ChannelResult<Box<dyn ByteStream>>> {
		let driver = self.driver.clone();
		let protocol = endpoint.protocol;
		let host = endpoint.address_port.address.to_string();
		let port = endpoint.address_port.port;
		Box::pin(async move {
			let transport = ModemTransport::open(driver, protocol, host, port).await.context(TransportSnafu)?;
			Ok(Box::new(transport) as Box<dyn ByteStream>)
		})
	}
}

/// Builds [`LoraTransport`]s over an injected [`LoraDriver`] (`spec.md`
/// §4.3 "LoRa transport"). A LoRa module has a single active connection, so
/// the endpoint argument is accepted for signature uniformity but ignored.
pub struct LoraTransportFactory {
	pub driver: Arc<dyn LoraDriver>,
}

impl TransportFactory for LoraTransportFactory {
	fn build(&self, _endpoint: &Endpoint) -> BoxFuture<'static, ChannelResult<Box<dyn ByteStream>>> {
		let driver = self.driver.clone();
		Box::pin(async move {
			let transport = LoraTransport::open(driver).await.context(TransportSnafu)?;
			Ok(Box::new(transport) as Box<dyn ByteStream>)
		})
	}
}
