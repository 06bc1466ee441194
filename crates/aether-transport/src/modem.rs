//! Cellular modem transport driver (`spec.md` §4.3 "Modem transport"),
//! grounded on `original_source/aether/adapters/modems/i_modem_driver.h`'s
//! `open_network`/`write_packet`/`close_network`/`data_event` method shape.
//! `ModemDriver` is the injected collaborator (the AT-command dialect and
//! modem hardware access are out of `spec.md` §1's scope); this module only
//! owns the chunking/framing logic layered on top of it.

use std::sync::Arc;

use aether_core::{
	event::EventSource,
	stream::{ByteStream, LinkState, StreamInfo},
	types::Protocol,
};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;

use crate::{
	error::{ConfigurationSnafu, TransportResult},
	framing::{FrameCollector, split_chunks},
};

/// Identifies one logical network connection opened through a
/// [`ModemDriver`]; the modem hardware, not this crate, allocates it.
pub type ConnectionIndex = u32;

/// Chunk ceiling for TCP-mode outbound writes (`spec.md` §4.3: "Chunks
/// outbound data into ≤1024-byte packets for TCP mode").
pub const MODEM_MAX_PACKET_SIZE: usize = 1024;

/// Driver contract for a cellular modem (`IModemDriver`). Implemented by a
/// platform-specific AT-command/PPP driver outside this crate's scope;
/// `aether-transport` only depends on this trait.
pub trait ModemDriver: Send + Sync {
	fn open_network(&self, protocol: Protocol, host: String, port: u16) -> BoxFuture<'_, TransportResult<ConnectionIndex>>;

	fn write_packet(&self, index: ConnectionIndex, data: Bytes) -> BoxFuture<'_, TransportResult<()>>;

	fn close_network(&self, index: ConnectionIndex) -> BoxFuture<'_, TransportResult<()>>;

	/// Fires `(index, bytes)` whenever the modem delivers inbound data for
	/// any open connection.
	fn data_event(&self) -> &EventSource<(ConnectionIndex, Bytes)>;
}

fn modem_stream_info(protocol: Protocol, link_state: LinkState) -> StreamInfo {
	StreamInfo {
		rec_element_size: MODEM_MAX_PACKET_SIZE as u32,
		max_element_size: if protocol == Protocol::Udp { MODEM_MAX_PACKET_SIZE as u32 } else { u32::MAX },
		is_reliable: protocol == Protocol::Tcp,
		link_state,
		is_writable: matches!(link_state, LinkState::Linked),
	}
}

pub struct ModemTransport {
	driver: Arc<dyn ModemDriver>,
	index: ConnectionIndex,
	protocol: Protocol,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	info: std::sync::Mutex<StreamInfo>,
	_data_sub: aether_core::event::Subscription,
}

impl ModemTransport {
	pub async fn open(driver: Arc<dyn ModemDriver>, protocol: Protocol, host: String, port: u16) -> TransportResult<Self> {
		if protocol == aether_core::types::Protocol::WebSocket {
			return ConfigurationSnafu { protocol: "WebSocket over modem" }.fail();
		}
		let index = driver.open_network(protocol, host, port).await?;

		let out_data = Arc::new(EventSource::new());
		let update = Arc::new(EventSource::new());
		let collector = std::sync::Mutex::new(FrameCollector::new());
		let reassemble_tcp = protocol == Protocol::Tcp;

		let out_data_clone = out_data.clone();
		let target_index = index;
		let sub = driver.data_event().subscribe(move |(event_index, data): &(ConnectionIndex, Bytes)| {
			if *event_index != target_index {
				return;
			}
			if reassemble_tcp {
				for frame in collector.lock().unwrap().push(data) {
					out_data_clone.emit(&frame);
				}
			} else {
				out_data_clone.emit(data);
			}
		});

		let info = modem_stream_info(protocol, LinkState::Linked);
		update.emit(&info);

		Ok(Self {
			driver,
			index,
			protocol,
			out_data,
			update,
			info: std::sync::Mutex::new(info),
			_data_sub: sub,
		})
	}
}

impl ByteStream for ModemTransport {
	fn write(&mut self, data: Bytes) -> aether_core::error::CoreResult<()> {
		let driver = self.driver.clone();
		let index = self.index;
		let packets: Vec<Bytes> = if self.protocol == Protocol::Tcp {
			let mut framed = BytesMut::with_capacity(data.len() + 5);
			aether_core::wire::encode_tiered(data.len() as u64, &mut framed)?;
			framed.extend_from_slice(&data);
			split_chunks(&framed, MODEM_MAX_PACKET_SIZE)
		} else {
			vec![data]
		};
		tokio::spawn(async move {
			for packet in packets {
				if let Err(err) = driver.write_packet(index, packet).await {
					tracing::warn!(%err, "modem write_packet failed");
					break;
				}
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
		*self.info.lock().unwrap()
	}
}

impl Drop for ModemTransport {
	fn drop(&mut self) {
		let driver = self.driver.clone();
		let index = self.index;
		tokio::spawn(async move {
			let _ = driver.close_network(index).await;
		});
	}
}

#[cfg(test)]
mod test {
	use std::sync::Mutex;

	use super::*;

	struct FakeModemDriver {
		data_event: EventSource<(ConnectionIndex, Bytes)>,
		opened: Mutex<Vec<(Protocol, String, u16)>>,
		written: Mutex<Vec<(ConnectionIndex, Bytes)>>,
	}

	impl FakeModemDriver {
		fn new() -> Self {
			Self {
				data_event: EventSource::new(),
				opened: Mutex::new(Vec::new()),
				written: Mutex::new(Vec::new()),
			}
		}
	}

	impl ModemDriver for FakeModemDriver {
		fn open_network(&self, protocol: Protocol, host: String, port: u16) -> BoxFuture<'_, TransportResult<ConnectionIndex>> {
			self.opened.lock().unwrap().push((protocol, host, port));
			Box::pin(async { Ok(1) })
		}

		fn write_packet(&self, index: ConnectionIndex, data: Bytes) -> BoxFuture<'_, TransportResult<()>> {
			self.written.lock().unwrap().push((index, data));
			Box::pin(async { Ok(()) })
		}

		fn close_network(&self, _index: ConnectionIndex) -> BoxFuture<'_, TransportResult<()>> {
			Box::pin(async { Ok(()) })
		}

		fn data_event(&self) -> &EventSource<(ConnectionIndex, Bytes)> {
			&self.data_event
		}
	}

	#[tokio::test]
	async fn tcp_mode_reassembles_framed_inbound_data() {
		let driver = Arc::new(FakeModemDriver::new());
		let transport = ModemTransport::open(driver.clone(), Protocol::Tcp, "cloud.aethernet.io".into(), 9010)
			.await
			.unwrap();

		let received = Arc::new(Mutex::new(Vec::new()));
		let r = received.clone();
		let _sub = transport.out_data_event().subscribe(move |data: &Bytes| r.lock().unwrap().push(data.clone()));

		let mut framed = BytesMut::new();
		aether_core::wire::encode_tiered(5, &mut framed).unwrap();
		framed.extend_from_slice(b"hello");
		driver.data_event().emit(&(1, framed.freeze()));

		assert_eq!(received.lock().unwrap().as_slice(), [Bytes::from_static(b"hello")]);
	}

	#[tokio::test]
	async fn udp_mode_delivers_datagrams_unframed() {
		let driver = Arc::new(FakeModemDriver::new());
		let transport = ModemTransport::open(driver.clone(), Protocol::Udp, "cloud.aethernet.io".into(), 9011)
			.await
			.unwrap();

		let received = Arc::new(Mutex::new(Vec::new()));
		let r = received.clone();
		let _sub = transport.out_data_event().subscribe(move |data: &Bytes| r.lock().unwrap().push(data.clone()));

		driver.data_event().emit(&(1, Bytes::from_static(b"datagram")));
		assert_eq!(received.lock().unwrap().as_slice(), [Bytes::from_static(b"datagram")]);
	}
}
