//! Work-cloud record shapes carried by the work-server API (`spec.md` §3,
//! §6), grounded on `original_source/aether/work_cloud_api/server_descriptor.h`,
//! `uid_and_cloud.h`, and `telemetric.h`.

use aether_core::{
	error::CoreResult,
	types::{Address, Protocol, ServerId, Uid},
	wire::{WireDecode, WireEncode, decode_tiered, encode_tiered},
};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// One (protocol, port) pair a server endpoint listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoderAndPort {
	pub protocol: Protocol,
	pub port: u16,
}

impl WireEncode for CoderAndPort {
	fn encode(&self, dst: &mut BytesMut) {
		self.protocol.encode(dst);
		self.port.encode(dst);
	}
}
impl WireDecode for CoderAndPort {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		let start = src.clone();
		let Some(protocol) = Protocol::decode(src)? else {
			*src = start;
			return Ok(None);
		};
		match u16::decode(src)? {
			Some(port) => Ok(Some(CoderAndPort { protocol, port })),
			None => {
				*src = start;
				Ok(None)
			}
		}
	}
}

/// One IP with every protocol/port it answers on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressAndPort {
	pub ip: Address,
	pub protocol_and_ports: Vec<CoderAndPort>,
}

impl IpAddressAndPort {
	pub fn encode(&self, dst: &mut BytesMut) -> CoreResult<()> {
		self.ip.encode(dst)?;
		self.protocol_and_ports.encode(dst);
		Ok(())
	}

	pub fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		let start = src.clone();
		let Some(ip) = Address::decode(src)? else {
			*src = start;
			return Ok(None);
		};
		match Vec::<CoderAndPort>::decode(src)? {
			Some(protocol_and_ports) => Ok(Some(IpAddressAndPort { ip, protocol_and_ports })),
			None => {
				*src = start;
				Ok(None)
			}
		}
	}
}

/// All known reachability info for one server (`spec.md` §3 `ServerDescriptor`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
	pub server_id: ServerId,
	pub ips: Vec<IpAddressAndPort>,
}

impl ServerDescriptor {
	pub fn encode(&self, dst: &mut BytesMut) -> CoreResult<()> {
		self.server_id.encode(dst);
		encode_tiered(self.ips.len() as u64, dst)?;
		for ip in &self.ips {
			ip.encode(dst)?;
		}
		Ok(())
	}

	pub fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		let start = src.clone();
		let Some(server_id) = ServerId::decode(src)? else {
			*src = start;
			return Ok(None);
		};
		let Some(len) = decode_tiered(src)? else {
			*src = start;
			return Ok(None);
		};
		let mut ips = Vec::with_capacity((len as usize).min(1 << 16));
		for _ in 0..len {
			match IpAddressAndPort::decode(src)? {
				Some(ip) => ips.push(ip),
				None => {
					*src = start;
					return Ok(None);
				}
			}
		}
		Ok(Some(ServerDescriptor { server_id, ips }))
	}
}

/// The set of server ids making up one client's cloud (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudDescriptor {
	pub sids: Vec<ServerId>,
}

impl WireEncode for CloudDescriptor {
	fn encode(&self, dst: &mut BytesMut) {
		self.sids.encode(dst);
	}
}
impl WireDecode for CloudDescriptor {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		Ok(Vec::<ServerId>::decode(src)?.map(|sids| CloudDescriptor { sids }))
	}
}

/// A cloud tagged with the uid it belongs to, used when resolving multiple
/// peers' clouds at once (`authorized_api::resolver_clouds`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidAndCloudDescriptor {
	pub uid: Uid,
	pub cloud: CloudDescriptor,
}

impl WireEncode for UidAndCloudDescriptor {
	fn encode(&self, dst: &mut BytesMut) {
		self.uid.encode(dst);
		self.cloud.encode(dst);
	}
}
impl WireDecode for UidAndCloudDescriptor {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		let start = src.clone();
		let Some(uid) = Uid::decode(src)? else {
			*src = start;
			return Ok(None);
		};
		match CloudDescriptor::decode(src)? {
			Some(cloud) => Ok(Some(UidAndCloudDescriptor { uid, cloud })),
			None => {
				*src = start;
				Ok(None)
			}
		}
	}
}

/// Client build telemetry sent via `authorized_api::send_telemetry`
/// (`spec.md` §3, `original_source/aether/work_cloud_api/telemetric.h`). Only
/// the `Cpp` variant exists in this crate — `type` is carried on the wire so
/// other client implementations in the same cloud can add variants without
/// breaking this one's ability to skip over unrecognized telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetric {
	pub utm_id: u32,
	pub blob: Bytes,
	pub lib_version: String,
	pub os: String,
	pub compiler: String,
}

const TELEMETRIC_TYPE_CPP: u8 = 0;
const TELEMETRIC_TYPE_RUST: u8 = 1;

impl WireEncode for Telemetric {
	fn encode(&self, dst: &mut BytesMut) {
		TELEMETRIC_TYPE_RUST.encode(dst);
		self.utm_id.encode(dst);
		self.blob.encode(dst);
		self.lib_version.encode(dst);
		self.os.encode(dst);
		self.compiler.encode(dst);
	}
}
impl WireDecode for Telemetric {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		let start = src.clone();
		macro_rules! field {
			($ty:ty) => {
				match <$ty>::decode(src)? {
					Some(v) => v,
					None => {
						*src = start;
						return Ok(None);
					}
				}
			};
		}
		let _kind = field!(u8);
		let utm_id = field!(u32);
		let blob = field!(Bytes);
		let lib_version = field!(String);
		let os = field!(String);
		let compiler = field!(String);
		Ok(Some(Telemetric {
			utm_id,
			blob,
			lib_version,
			os,
			compiler,
		}))
	}
}

#[cfg(test)]
mod test {
	use std::net::Ipv4Addr;

	use super::*;

	#[test]
	fn server_descriptor_round_trips() {
		let descriptor = ServerDescriptor {
			server_id: 7,
			ips: vec![IpAddressAndPort {
				ip: Address::IPv4(Ipv4Addr::LOCALHOST),
				protocol_and_ports: vec![CoderAndPort { protocol: Protocol::Tcp, port: 9000 }],
			}],
		};
		let mut buf = BytesMut::new();
		descriptor.encode(&mut buf).unwrap();
		let mut b = buf.freeze();
		assert_eq!(ServerDescriptor::decode(&mut b).unwrap().unwrap(), descriptor);
	}

	#[test]
	fn uid_and_cloud_descriptor_round_trips() {
		let value = UidAndCloudDescriptor {
			uid: Uid::from_bytes([3u8; 16]),
			cloud: CloudDescriptor { sids: vec![1, 2, 3] },
		};
		let mut buf = BytesMut::new();
		value.encode(&mut buf);
		let mut b = buf.freeze();
		assert_eq!(UidAndCloudDescriptor::decode(&mut b).unwrap().unwrap(), value);
	}

	#[test]
	fn telemetric_decode_accepts_other_client_types() {
		// A C++ client's telemetry (`TELEMETRIC_TYPE_CPP`) must still decode —
		// `type` exists so peers can skip unrecognized variants, not so this
		// client rejects them.
		let mut buf = BytesMut::new();
		TELEMETRIC_TYPE_CPP.encode(&mut buf);
		42u32.encode(&mut buf);
		Bytes::from_static(b"diag").encode(&mut buf);
		"1.0.0".to_string().encode(&mut buf);
		"linux".to_string().encode(&mut buf);
		"clang".to_string().encode(&mut buf);
		let mut b = buf.freeze();
		let decoded = Telemetric::decode(&mut b).unwrap().unwrap();
		assert_eq!(decoded.utm_id, 42);
	}

	#[test]
	fn telemetric_round_trips() {
		let value = Telemetric {
			utm_id: 42,
			blob: Bytes::from_static(b"diag"),
			lib_version: "0.1.0".to_string(),
			os: "linux".to_string(),
			compiler: "rustc".to_string(),
		};
		let mut buf = BytesMut::new();
		value.encode(&mut buf);
		let mut b = buf.freeze();
		assert_eq!(Telemetric::decode(&mut b).unwrap().unwrap(), value);
	}
}
