//! Loopback connection/streaming demo: dials and accepts a TCP channel
//! in-process, layers the crypto + sized-framing gates (C6) and a
//! safe-stream (C7) on top of the raw socket (C4), and exchanges a batch of
//! messages end to end — `spec.md` §8 scenario S1 without the server-side
//! plumbing `spec.md` §1 puts out of scope.
//!
//! Stands in for `wind::main`'s SOCKS5⇄TUIC proxy wiring: that bin crate had
//! an inbound/outbound pair to glue together, this one has a channel and a
//! peer stream instead, so the wiring is a loopback exchange rather than a
//! long-running proxy loop.

use std::{
	net::SocketAddr,
	sync::{Arc, Mutex},
	time::Duration,
};

use aether_core::stream::{ByteStream, LinkState};
use aether_stream::{CryptoGate, SafeStream, SafeStreamConfig, SizedPacketGate, StaticKeyProvider};
use aether_transport::TcpTransport;
use bytes::Bytes;
use tokio::net::TcpListener;

/// Shared symmetric key both ends of the demo use — a stand-in for the
/// `ClientConfig::master_key` a real session would derive during
/// registration (`spec.md` §3, §6).
const DEMO_KEY: [u8; 32] = *b"aether-demo-loopback-key-bytes!!";

/// `Sized(Crypto(tcp))`, the same gate-chain composition `spec.md` §4.2
/// describes, then a safe-stream (C7) layered on top for ordered,
/// deduplicated delivery.
fn build_stream(transport: Box<dyn ByteStream>, config: SafeStreamConfig) -> SafeStream {
	let keyed: Box<dyn ByteStream> = Box::new(CryptoGate::new(transport, &StaticKeyProvider(DEMO_KEY)));
	let framed: Box<dyn ByteStream> = Box::new(SizedPacketGate::new(keyed));
	SafeStream::new(framed, config)
}

/// Blocks until `stream`'s link state reaches `Linked`, polling `info()` on
/// a short interval. There is no dedicated "wait for link" action in this
/// demo (`spec.md` §4.4's `TransportBuilderAction` plays that role inside
/// the real channel layer); a poll loop is adequate for a two-peer loopback.
async fn wait_linked(stream: &dyn ByteStream) {
	loop {
		if stream.info().link_state == LinkState::Linked {
			return;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

/// Runs the full exchange and returns every payload the listening side
/// received, in arrival order — used directly by `main`'s `demo` subcommand
/// and by the integration tests in `tests.rs`.
pub async fn run_loopback_exchange(listen_addr: SocketAddr, messages: &[String], config: SafeStreamConfig) -> eyre::Result<Vec<Bytes>> {
	let listener = TcpListener::bind(listen_addr).await?;
	let bound_addr = listener.local_addr()?;

	let accepted = tokio::spawn(async move {
		let (socket, _peer) = listener.accept().await?;
		Ok::<_, std::io::Error>(socket)
	});

	let dialer: Box<dyn ByteStream> = Box::new(TcpTransport::connect(bound_addr));
	let accepted_socket = accepted.await??;
	let listener_side: Box<dyn ByteStream> = Box::new(TcpTransport::from_stream(accepted_socket));

	let mut dialer_stream = build_stream(dialer, config);
	let listener_stream = build_stream(listener_side, config);

	wait_linked(&dialer_stream).await;
	wait_linked(&listener_stream).await;

	let received = Arc::new(Mutex::new(Vec::new()));
	let collected = received.clone();
	let _sub = listener_stream
		.out_data_event()
		.subscribe(move |data: &Bytes| collected.lock().unwrap().push(data.clone()));

	for message in messages {
		dialer_stream.write(Bytes::copy_from_slice(message.as_bytes()))?;
	}

	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		if received.lock().unwrap().len() >= messages.len() || tokio::time::Instant::now() >= deadline {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	let out = received.lock().unwrap().clone();
	Ok(out)
}
