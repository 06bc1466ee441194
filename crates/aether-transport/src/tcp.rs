//! TCP transport driver (`spec.md` §4.3 "TCP transport"). Owns a
//! non-blocking `tokio::net::TcpStream`; state machine `{connecting →
//! linked | link-error; linked → link-error}`. Reads accumulate into a
//! length-prefixed frame collector (the tiered-int scheme of `spec.md` §6,
//! the Rust stand-in for `StreamDataPacketCollector`) and emit one
//! `out_data_event` per complete frame; writes are length-prefixed the same
//! way before being enqueued.
//!
//! Grounded on `wind_core::io::copy_io`'s two-directional read/write loop
//! idiom, generalized from raw byte copying to framed read/write since
//! `spec.md` requires whole-frame `out_data_event`s rather than raw stream
//! bytes.

use std::{net::SocketAddr, sync::Arc};

use aether_core::{
	event::EventSource,
	stream::{ByteStream, LinkState, StreamInfo},
	wire::encode_tiered,
};
use bytes::{Bytes, BytesMut};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{
		TcpStream,
		tcp::{OwnedReadHalf, OwnedWriteHalf},
	},
	sync::{mpsc, watch},
};

use crate::error::{ConnectSnafu, IoSnafu, NotLinkedSnafu, TransportError, TransportResult};

/// TCP stream's effective MTU headroom for a single recommended write
/// (`spec.md` §4.3: `rec_element_size = MTU - 2`).
const ASSUMED_MTU: u32 = 1500;

fn tcp_stream_info(link_state: LinkState) -> StreamInfo {
	StreamInfo {
		rec_element_size: ASSUMED_MTU.saturating_sub(2),
		max_element_size: u32::MAX,
		is_reliable: true,
		link_state,
		is_writable: matches!(link_state, LinkState::Linked),
	}
}

/// Reads one length-prefixed frame off `rd`, or `Ok(None)` on a clean EOF
/// between frames.
async fn read_frame(rd: &mut OwnedReadHalf) -> std::io::Result<Option<Bytes>> {
	let marker = match rd.read_u8().await {
		Ok(b) => b,
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e),
	};
	let len = match marker {
		0..=249 => marker as usize,
		250 => rd.read_u16_le().await? as usize,
		251 => rd.read_u32_le().await? as usize,
		_ => unreachable!("marker is a u8 and all 256 values are covered above"),
	};
	let mut buf = vec![0u8; len];
	rd.read_exact(&mut buf).await?;
	Ok(Some(Bytes::from(buf)))
}

async fn write_frame(wr: &mut OwnedWriteHalf, data: &[u8]) -> TransportResult<()> {
	let mut framed = BytesMut::with_capacity(5 + data.len());
	encode_tiered(data.len() as u64, &mut framed)?;
	framed.extend_from_slice(data);
	wr.write_all(&framed).await.context(IoSnafu)?;
	Ok(())
}

use snafu::ResultExt;

async fn run(
	addr: SocketAddr,
	write_rx: mpsc::UnboundedReceiver<Bytes>,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	state_tx: watch::Sender<StreamInfo>,
) {
	let connected = match TcpStream::connect(addr).await.context(ConnectSnafu { addr: addr.to_string() }) {
		Ok(stream) => stream,
		Err(err) => {
			tracing::warn!(%addr, %err, "tcp connect failed");
			let info = tcp_stream_info(LinkState::LinkError);
			let _ = state_tx.send(info);
			update.emit(&info);
			return;
		}
	};
	let _ = connected.set_nodelay(true);
	run_connected(connected, write_rx, out_data, update, state_tx).await;
}

/// Drives the read/write loop over an already-established socket, shared by
/// [`TcpTransport::connect`] (which dials out) and
/// [`TcpTransport::from_stream`] (which wraps a socket a listener already
/// accepted — the one piece of server-side plumbing this crate needs so a
/// test double can speak the same framed wire format as a real client).
async fn run_connected(
	connected: TcpStream,
	mut write_rx: mpsc::UnboundedReceiver<Bytes>,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	state_tx: watch::Sender<StreamInfo>,
) {
	let peer = connected.peer_addr().ok();
	let (mut rd, mut wr) = connected.into_split();
	{
		let info = tcp_stream_info(LinkState::Linked);
		let _ = state_tx.send(info);
		update.emit(&info);
	}

	loop {
		tokio::select! {
			biased;
			maybe_write = write_rx.recv() => {
				match maybe_write {
					Some(data) => {
						if let Err(err) = write_frame(&mut wr, &data).await {
							tracing::warn!(?peer, %err, "tcp write failed");
							break;
						}
					}
					None => break,
				}
			}
			read_result = read_frame(&mut rd) => {
				match read_result {
					Ok(Some(frame)) => out_data.emit(&frame),
					Ok(None) => {
						tracing::debug!(?peer, "tcp peer closed");
						break;
					}
					Err(err) => {
						tracing::warn!(?peer, %err, "tcp read failed");
						break;
					}
				}
			}
		}
	}

	let info = tcp_stream_info(LinkState::LinkError);
	let _ = state_tx.send(info);
	update.emit(&info);
}

/// Where a [`TcpTransport`]'s socket came from — dialing out is the only
/// path `spec.md` §4.3 describes; [`Origin::Accepted`] exists solely so a
/// test double standing in for the out-of-scope server side (`spec.md` §1
/// Non-goals) can speak the same framed wire format as a real client
/// without duplicating `read_frame`/`write_frame`.
enum Origin {
	Dial(SocketAddr),
	Accepted,
}

/// A live or connecting TCP [`ByteStream`]. Construction never blocks:
/// [`TcpTransport::connect`] spawns the connect/read/write loop and returns
/// immediately in `Linking` state; subscribe to [`stream_update_event`] to
/// learn when it reaches `Linked` or `LinkError`.
pub struct TcpTransport {
	origin: Origin,
	write_tx: mpsc::UnboundedSender<Bytes>,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	state_rx: watch::Receiver<StreamInfo>,
	task: tokio::task::JoinHandle<()>,
}

impl TcpTransport {
	pub fn connect(addr: SocketAddr) -> Self {
		let (write_tx, write_rx) = mpsc::unbounded_channel();
		let out_data = Arc::new(EventSource::new());
		let update = Arc::new(EventSource::new());
		let (state_tx, state_rx) = watch::channel(tcp_stream_info(LinkState::Linking));

		let out_data_clone = out_data.clone();
		let update_clone = update.clone();
		let task = tokio::spawn(run(addr, write_rx, out_data_clone, update_clone, state_tx));

		Self {
			origin: Origin::Dial(addr),
			write_tx,
			out_data,
			update,
			state_rx,
			task,
		}
	}

	/// Wraps a socket a `tokio::net::TcpListener` already accepted. Not part
	/// of `spec.md`'s client-only scope on its own; it exists so
	/// server-standing-in test doubles can reuse this driver's framing
	/// instead of reimplementing it.
	pub fn from_stream(stream: TcpStream) -> Self {
		let _ = stream.set_nodelay(true);
		let (write_tx, write_rx) = mpsc::unbounded_channel();
		let out_data = Arc::new(EventSource::new());
		let update = Arc::new(EventSource::new());
		let (state_tx, state_rx) = watch::channel(tcp_stream_info(LinkState::Linking));

		let out_data_clone = out_data.clone();
		let update_clone = update.clone();
		let task = tokio::spawn(run_connected(stream, write_rx, out_data_clone, update_clone, state_tx));

		Self {
			origin: Origin::Accepted,
			write_tx,
			out_data,
			update,
			state_rx,
			task,
		}
	}
}

impl ByteStream for TcpTransport {
	fn write(&mut self, data: Bytes) -> aether_core::error::CoreResult<()> {
		ensure_linked(&self.info())?;
		if self.write_tx.send(data).is_err() {
			return Err(NotLinkedSnafu.build().into());
		}
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

	fn restream(&mut self) {
		self.task.abort();
		match self.origin {
			Origin::Dial(addr) => *self = TcpTransport::connect(addr),
			Origin::Accepted => {
				let info = tcp_stream_info(LinkState::LinkError);
				let (state_tx, state_rx) = watch::channel(info);
				let _ = state_tx;
				self.state_rx = state_rx;
				self.update.emit(&info);
			}
		}
	}
}

impl Drop for TcpTransport {
	fn drop(&mut self) {
		self.task.abort();
	}
}

/// Returns `TransportError::NotLinked` if `write()` is attempted while the
/// link isn't up — used by higher layers that want a synchronous rejection
/// rather than silently dropping the data.
pub fn ensure_linked(info: &StreamInfo) -> TransportResult<()> {
	if info.link_state != LinkState::Linked {
		return NotLinkedSnafu.fail();
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use tokio::net::TcpListener;

	use super::*;

	#[tokio::test]
	async fn connect_and_exchange_one_frame() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let server = tokio::spawn(async move {
			let (socket, _) = listener.accept().await.unwrap();
			let (mut rd, mut wr) = socket.into_split();
			let frame = read_frame(&mut rd).await.unwrap().unwrap();
			write_frame(&mut wr, &frame).await.unwrap();
		});

		let mut client = TcpTransport::connect(addr);
		let received = std::sync::Arc::new(std::sync::Mutex::new(None));
		let r = received.clone();
		let _sub = client.out_data_event().subscribe(move |data: &Bytes| {
			*r.lock().unwrap() = Some(data.clone());
		});

		// wait for Linked
		for _ in 0..50 {
			if client.info().link_state == LinkState::Linked {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(client.info().link_state, LinkState::Linked);

		client.write(Bytes::from_static(b"ping")).unwrap();

		for _ in 0..50 {
			if received.lock().unwrap().is_some() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(received.lock().unwrap().as_ref(), Some(&Bytes::from_static(b"ping")));
		server.await.unwrap();
	}

	#[tokio::test]
	async fn connect_failure_reports_link_error() {
		// Port 0 after binding nothing should fail to connect quickly on loopback.
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let client = TcpTransport::connect(addr);
		for _ in 0..50 {
			if client.info().link_state == LinkState::LinkError {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(client.info().link_state, LinkState::LinkError);
	}
}
