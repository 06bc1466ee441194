//! Cross-crate integration test for `spec.md` §4.7 (C9): a
//! `ClientServerConnection` dialing a real TCP listener standing in for a
//! work server, speaking the actual gate chain (channel selection → crypto →
//! sized-packet framing) and the actual `login_by_uid(uid, ping(...))` wire
//! call from `spec.md` §6's "Authorized session". The test double on the
//! listener side only understands enough of the protocol to accept the login
//! and ack the embedded ping, the same scope `wind-tuic`'s integration test
//! double (`DirectCallback`) keeps for its proxied protocol.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use aether_channel::{
	Channel, ChannelTransportProperties, ConnectionType, Reliability, Resolver, TransportFactory,
	access_point::{AccessPoint, AccessPointDriver},
	adapter::Adapter,
	channel::NoDnsResolver,
	error::ChannelResult,
};
use aether_client::server::{ClientServerConnection, ServerConnectionManagerConfig};
use aether_core::{
	stream::{ByteStream, LinkState},
	types::{Address, AddressPort, Endpoint, Protocol, ServerConfig, Uid},
};
use aether_stream::{CryptoGate, SizedPacketGate, StaticKeyProvider};
use aether_transport::tcp::TcpTransport;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::net::TcpListener;

const MASTER_KEY: [u8; 32] = [5u8; 32];

struct NoopDriver;
impl AccessPointDriver for NoopDriver {
	fn connect(&self) -> BoxFuture<'static, Result<(), String>> {
		Box::pin(async { Ok(()) })
	}
}

/// Dials a real TCP socket and waits for it to reach `Linked` before handing
/// the stream back, matching the contract `transport_builder` expects of a
/// `TransportFactory` (`spec.md` §4.4 phase 4 "Await link").
struct TcpDialFactory;
impl TransportFactory for TcpDialFactory {
	fn build(&self, endpoint: &Endpoint) -> BoxFuture<'static, ChannelResult<Box<dyn ByteStream>>> {
		let Address::IPv4(ip) = endpoint.address_port.address else {
			unreachable!("test only dials IPv4 loopback");
		};
		let addr = std::net::SocketAddr::new(ip.into(), endpoint.address_port.port);
		Box::pin(async move {
			let mut transport = TcpTransport::connect(addr);
			for _ in 0..200 {
				if transport.info().link_state == LinkState::Linked {
					return Ok(Box::new(transport) as Box<dyn ByteStream>);
				}
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
			aether_channel::error::AccessPointConnectSnafu { reason: "tcp dial never linked" }.fail()
		})
	}
}

fn test_channels(port: u16) -> Vec<Arc<Channel>> {
	let ap = AccessPoint::new(1, Arc::new(NoopDriver));
	let adapter = Adapter::new(1, vec![ap.clone()]);
	let endpoint = Endpoint {
		address_port: AddressPort {
			address: Address::IPv4(Ipv4Addr::LOCALHOST),
			port,
		},
		protocol: Protocol::Tcp,
	};
	vec![Channel::new(
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
	)]
}

/// Runs the work-server side of the handshake just far enough to ack the
/// login: decrypt/deframe the first frame, pull the correlation id out of the
/// embedded `ping` sub-API call, and reply with `send_result(correlation_id)`
/// through the same gate chain the client is speaking.
async fn run_fake_server(listener: TcpListener) {
	let (socket, _) = listener.accept().await.unwrap();
	let tcp = TcpTransport::from_stream(socket);
	for _ in 0..200 {
		if tcp.info().link_state == LinkState::Linked {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	let keyed = CryptoGate::new(Box::new(tcp), &StaticKeyProvider(MASTER_KEY));
	let mut framed: Box<dyn ByteStream> = Box::new(SizedPacketGate::new(Box::new(keyed)));

	let received = Arc::new(std::sync::Mutex::new(None));
	let r = received.clone();
	let _sub = framed.out_data_event().subscribe(move |frame: &Bytes| {
		*r.lock().unwrap() = Some(frame.clone());
	});

	for _ in 0..200 {
		if received.lock().unwrap().is_some() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	let login_frame = received.lock().unwrap().clone().expect("server never received a login frame");

	// [LOGIN_BY_UID][uid: 16 bytes][sub_api: tiered-len-prefixed blob].
	// The blob is [PING][correlation_id: u32 LE][next_connect_ms: u64 LE].
	assert_eq!(login_frame[0], aether_api::work_server_api::login_api::LOGIN_BY_UID);
	let mut rest = login_frame.slice(1 + 16..);
	let blob = aether_api::method::decode_sub_api(&mut rest).unwrap().expect("sub-api blob present");
	assert_eq!(blob[0], aether_api::work_server_api::authorized_api::PING);
	let correlation_id = (&blob[1..5]).get_u32_le();

	let mut reply = BytesMut::new();
	reply.put_u8(aether_api::correlation::METHOD_SEND_RESULT);
	reply.put_u32_le(correlation_id);
	framed.write(reply.freeze()).unwrap();
}

#[tokio::test]
async fn client_server_connection_completes_login_over_real_tcp() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let server_task = tokio::spawn(run_fake_server(listener));

	let server_config = ServerConfig { server_id: 1, endpoints: vec![] };
	let connection = tokio::time::timeout(
		Duration::from_secs(5),
		ClientServerConnection::connect(
			server_config,
			Uid::from_bytes([1u8; 16]),
			Uid::ZERO,
			&MASTER_KEY,
			test_channels(addr.port()),
			Arc::new(NoDnsResolver) as Arc<dyn Resolver>,
			Arc::new(TcpDialFactory) as Arc<dyn TransportFactory>,
			ServerConnectionManagerConfig::default(),
		),
	)
	.await
	.expect("login did not complete in time")
	.expect("login failed");

	assert!(connection.is_authorized());
	assert_eq!(connection.server_id(), 1);

	server_task.await.unwrap();
}
