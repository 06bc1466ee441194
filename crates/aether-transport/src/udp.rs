//! UDP transport driver (`spec.md` §4.3 "UDP transport"). Datagram-oriented,
//! `is_reliable = false`; no reordering or deduplication happens at this
//! layer (that's the safe-stream's job, C7). Writes that don't fit in one
//! datagram fail synchronously (`spec.md` §8 boundary behavior: "UDP
//! transport with payload > max datagram size: `write()` action resolves
//! with `TransportFailure` synchronously").
//!
//! Grounded on `wind-core::udp`'s `AbstractUdpSocket`/`UdpPacket` shape.

use std::{net::SocketAddr, sync::Arc};

use aether_core::{
	event::EventSource,
	stream::{ByteStream, LinkState, StreamInfo},
};
use bytes::Bytes;
use snafu::ResultExt;
use tokio::{net::UdpSocket, sync::watch};

use crate::error::{ConnectSnafu, DatagramTooLargeSnafu, IoSnafu, TransportResult};

/// Conservative IPv4 UDP payload ceiling that stays well clear of
/// fragmentation on typical path MTUs.
pub const MAX_DATAGRAM_SIZE: usize = 1472;

fn udp_stream_info(link_state: LinkState) -> StreamInfo {
	StreamInfo {
		rec_element_size: MAX_DATAGRAM_SIZE as u32,
		max_element_size: MAX_DATAGRAM_SIZE as u32,
		is_reliable: false,
		link_state,
		is_writable: matches!(link_state, LinkState::Linked),
	}
}

async fn run(socket: Arc<UdpSocket>, out_data: Arc<EventSource<Bytes>>, update: Arc<EventSource<StreamInfo>>, state_tx: watch::Sender<StreamInfo>) {
	let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
	loop {
		match socket.recv(&mut buf).await {
			Ok(n) => out_data.emit(&Bytes::copy_from_slice(&buf[..n])),
			Err(err) => {
				tracing::warn!(%err, "udp recv failed");
				let info = udp_stream_info(LinkState::LinkError);
				let _ = state_tx.send(info);
				update.emit(&info);
				break;
			}
		}
	}
}

/// A connected (via `connect()`) UDP datagram [`ByteStream`]. "Connected"
/// here only fixes the peer address for `send`/`recv`; no handshake occurs,
/// matching `spec.md` §4.3's "connection-less" classification.
pub struct UdpTransport {
	socket: Arc<UdpSocket>,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	state_rx: watch::Receiver<StreamInfo>,
	task: tokio::task::JoinHandle<()>,
}

impl UdpTransport {
	pub async fn connect(peer: SocketAddr) -> TransportResult<Self> {
		let bind_addr: SocketAddr = if peer.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };
		let socket = UdpSocket::bind(bind_addr).await.context(IoSnafu)?;
		socket.connect(peer).await.context(ConnectSnafu { addr: peer.to_string() })?;
		let socket = Arc::new(socket);

		let out_data = Arc::new(EventSource::new());
		let update = Arc::new(EventSource::new());
		let (state_tx, state_rx) = watch::channel(udp_stream_info(LinkState::Linked));
		update.emit(&udp_stream_info(LinkState::Linked));

		let task = tokio::spawn(run(socket.clone(), out_data.clone(), update.clone(), state_tx));

		Ok(Self {
			socket,
			out_data,
			update,
			state_rx,
			task,
		})
	}
}

impl ByteStream for UdpTransport {
	fn write(&mut self, data: Bytes) -> aether_core::error::CoreResult<()> {
		if data.len() > MAX_DATAGRAM_SIZE {
			// `spec.md` §8: oversize writes fail synchronously, not via the
			// link-error path — this is a caller bug, not a link failure.
			tracing::warn!(len = data.len(), max = MAX_DATAGRAM_SIZE, "udp write exceeds datagram size");
			return Err(DatagramTooLargeSnafu { len: data.len(), max: MAX_DATAGRAM_SIZE }.build().into());
		}
		let socket = self.socket.clone();
		tokio::spawn(async move {
			if let Err(err) = socket.send(&data).await {
				tracing::warn!(%err, "udp send failed");
			}
		});
		Ok(())
	}

	fn out_data_event(&self) -> &EventSource<Bytes> {
		&self.out_data
	}

	fn stream_update_event(&self) -> &EventSource<StreamInfo> {
		&self.update
	}

	fn info(&self) -> StreamInfo {
		*self.state_rx.borrow()
	}
}

impl Drop for UdpTransport {
	fn drop(&mut self) {
		self.task.abort();
	}
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn exchanges_one_datagram() {
		let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_addr = server.local_addr().unwrap();

		let mut client = UdpTransport::connect(server_addr).await.unwrap();
		client.write(Bytes::from_static(b"hi")).unwrap();

		let mut buf = [0u8; 16];
		let (n, peer) = tokio::time::timeout(Duration::from_secs(1), server.recv_from(&mut buf))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&buf[..n], b"hi");

		server.send_to(b"ack", peer).await.unwrap();
		let received = std::sync::Arc::new(std::sync::Mutex::new(None));
		let r = received.clone();
		let _sub = client.out_data_event().subscribe(move |data: &Bytes| *r.lock().unwrap() = Some(data.clone()));

		for _ in 0..50 {
			if received.lock().unwrap().is_some() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(received.lock().unwrap().as_ref(), Some(&Bytes::from_static(b"ack")));
	}

	#[tokio::test]
	async fn oversize_write_fails_synchronously() {
		let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_addr = server.local_addr().unwrap();
		let mut client = UdpTransport::connect(server_addr).await.unwrap();

		let oversize = Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE + 1]);
		assert!(client.write(oversize).is_err());
	}
}
