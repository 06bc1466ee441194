use std::net::{SocketAddr, ToSocketAddrs};

use aether_core::types::{Address, AddressPort};

/// Converts an [`AddressPort`] to a [`SocketAddr`], grounded on
/// `wind::util::target_addr_to_socket_addr`'s IPv4/IPv6/domain split —
/// generalized here to a synchronous `Result` instead of `expect()`, since
/// this rewrite never panics on a runtime DNS failure (`spec.md` §7:
/// "runtime errors are never fatal to the engine").
pub fn address_port_to_socket_addr(addr: &AddressPort) -> eyre::Result<SocketAddr> {
	match &addr.address {
		Address::IPv4(ip) => Ok(SocketAddr::from((*ip, addr.port))),
		Address::IPv6(ip) => Ok(SocketAddr::from((*ip, addr.port))),
		Address::Named(name) => (name.as_str(), addr.port)
			.to_socket_addrs()?
			.next()
			.ok_or_else(|| eyre::eyre!("no address found for {name}")),
	}
}
