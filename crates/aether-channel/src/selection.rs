//! Channel selection stream (`spec.md` §4.4 C5.1): given a list of candidate
//! channels sorted by expected quality, tries `transport_builder()` on each
//! in order with a cumulative timeout, forwarding the first live transport
//! and falling through transparently on failure (`spec.md` §8 scenario S4).

use std::{sync::Arc, time::Duration};

use aether_core::{
	error::CoreResult,
	event::{EventSource, Subscription},
	stream::{ByteStream, LinkState, StreamInfo},
};
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::{
	channel::{Channel, Resolver, TransportFactory},
	error::{AllChannelsFailedSnafu, ChannelResult, NoChannelsSnafu},
};

/// Sorts candidates by ascending p99 connect time, unsampled channels last
/// (`spec.md` §4.4: "sorted by expected quality: smallest p99 connect time
/// first").
pub fn sort_by_expected_quality(channels: &mut [Arc<Channel>]) {
	channels.sort_by_key(|c| c.connect_time_p99().unwrap_or(Duration::MAX));
}

async fn try_candidates(
	channels: Vec<Arc<Channel>>,
	resolver: Arc<dyn Resolver>,
	factory: Arc<dyn TransportFactory>,
	is_lora: bool,
) -> ChannelResult<Box<dyn ByteStream>> {
	if channels.is_empty() {
		return NoChannelsSnafu.fail();
	}
	let count = channels.len();
	for channel in &channels {
		let budget = channel.transport_build_timeout(is_lora);
		match tokio::time::timeout(budget, channel.transport_builder(resolver.as_ref(), factory.as_ref())).await {
			Ok(Ok(stream)) => return Ok(stream),
			Ok(Err(err)) => tracing::warn!(endpoint = %channel.endpoint().address_port, %err, "candidate channel failed"),
			Err(_) => {
				tracing::warn!(endpoint = %channel.endpoint().address_port, ?budget, "candidate channel timed out");
			}
		}
	}
	AllChannelsFailedSnafu { count }.fail()
}

/// A [`ByteStream`] whose underlying transport is chosen by trying candidate
/// channels in order. Exposes the familiar write/out-data/stream-info
/// surface so callers above it (gates, safe-stream) don't need to know
/// channel selection happened at all.
pub struct ChannelSelectionStream {
	write_tx: mpsc::UnboundedSender<Bytes>,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	state_rx: watch::Receiver<StreamInfo>,
}

impl ChannelSelectionStream {
	/// Spawns the selection task and returns immediately in `Linking` state
	/// (`spec.md` §4.4's C5.1). `spec.md` §8: "Channel selection with zero
	/// candidates: selection-stream emits link-error immediately."
	pub fn connect(
		mut channels: Vec<Arc<Channel>>,
		resolver: Arc<dyn Resolver>,
		factory: Arc<dyn TransportFactory>,
		is_lora: bool,
	) -> Self {
		sort_by_expected_quality(&mut channels);

		let out_data = Arc::new(EventSource::new());
		let update = Arc::new(EventSource::new());
		let (write_tx, write_rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = watch::channel(StreamInfo::linking());

		let out_data_clone = out_data.clone();
		let update_clone = update.clone();
		tokio::spawn(async move {
			match try_candidates(channels, resolver, factory, is_lora).await {
				Ok(stream) => run_forwarding(stream, write_rx, out_data_clone, update_clone, state_tx).await,
				Err(err) => {
					tracing::warn!(%err, "channel selection exhausted every candidate");
					let info = StreamInfo {
						link_state: LinkState::LinkError,
						..StreamInfo::unlinked()
					};
					let _ = state_tx.send(info);
					update_clone.emit(&info);
				}
			}
		});

		Self {
			write_tx,
			out_data,
			update,
			state_rx,
		}
	}
}

async fn run_forwarding(
	mut stream: Box<dyn ByteStream>,
	mut write_rx: mpsc::UnboundedReceiver<Bytes>,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	state_tx: watch::Sender<StreamInfo>,
) {
	let _ = state_tx.send(stream.info());
	update.emit(&stream.info());

	// Forward inbound data for as long as the underlying stream lives. A
	// `Subscription` guard on a stack-owned `dyn ByteStream` is fine here
	// because the forwarding task itself owns `stream` for its whole life.
	let _data_sub: Subscription = {
		let out_data = out_data.clone();
		stream.out_data_event().subscribe(move |data: &Bytes| out_data.emit(data))
	};
	let _update_sub: Subscription = {
		let update = update.clone();
		let state_tx = state_tx.clone();
		stream.stream_update_event().subscribe(move |info: &StreamInfo| {
			let _ = state_tx.send(*info);
			update.emit(info);
		})
	};

	while let Some(data) = write_rx.recv().await {
		if let Err(err) = stream.write(data) {
			tracing::warn!(%err, "write through selected channel failed");
			break;
		}
	}
}

impl ByteStream for ChannelSelectionStream {
	fn write(&mut self, data: Bytes) -> CoreResult<()> {
		if self.write_tx.send(data).is_err() {
			tracing::debug!("write after channel selection stream closed, dropping");
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
}

#[cfg(test)]
mod test {
	use std::{net::Ipv4Addr, sync::Mutex};

	use aether_core::{
		stream::LoopbackStream,
		types::{Address, AddressPort, Endpoint, Protocol},
	};
	use futures::future::BoxFuture;

	use super::*;
	use crate::{
		access_point::{AccessPoint, AccessPointDriver},
		adapter::Adapter,
		channel::{ChannelTransportProperties, ConnectionType, NoDnsResolver, Reliability},
	};

	struct NoopDriver;
	impl AccessPointDriver for NoopDriver {
		fn connect(&self) -> BoxFuture<'static, Result<(), String>> {
			Box::pin(async { Ok(()) })
		}
	}

	struct FlakyFactory {
		fail_first: Mutex<bool>,
	}
	impl TransportFactory for FlakyFactory {
		fn build(&self, _endpoint: &Endpoint) -> BoxFuture<'static, ChannelResult<Box<dyn ByteStream>>> {
			let mut guard = self.fail_first.lock().unwrap();
			let should_fail = *guard;
			*guard = false;
			Box::pin(async move {
				if should_fail {
					crate::error::AccessPointConnectSnafu { reason: "simulated link failure" }.fail()
				} else {
					Ok(Box::new(LoopbackStream::pair().0) as Box<dyn ByteStream>)
				}
			})
		}
	}

	fn channel(props: ChannelTransportProperties, port: u16) -> Arc<Channel> {
		let ap = AccessPoint::new(1, Arc::new(NoopDriver));
		let adapter = Adapter::new(1, vec![ap.clone()]);
		let endpoint = Endpoint {
			address_port: AddressPort {
				address: Address::IPv4(Ipv4Addr::LOCALHOST),
				port,
			},
			protocol: Protocol::Tcp,
		};
		Channel::new(endpoint, adapter, ap, props, 100, 100)
	}

	fn props() -> ChannelTransportProperties {
		ChannelTransportProperties {
			max_packet_size: 1500,
			rec_packet_size: 1400,
			connection_type: ConnectionType::Full,
			reliability: Reliability::Reliable,
		}
	}

	#[tokio::test]
	async fn falls_through_to_next_channel_on_failure() {
		let channels = vec![channel(props(), 1), channel(props(), 2)];
		let factory: Arc<dyn TransportFactory> = Arc::new(FlakyFactory { fail_first: Mutex::new(true) });
		let mut selection = ChannelSelectionStream::connect(channels, Arc::new(NoDnsResolver), factory, false);

		for _ in 0..50 {
			if selection.info().link_state == LinkState::Linked {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(selection.info().link_state, LinkState::Linked);
		selection.write(Bytes::from_static(b"hi")).unwrap();
	}

	#[tokio::test]
	async fn zero_candidates_yields_link_error_immediately() {
		let factory: Arc<dyn TransportFactory> = Arc::new(FlakyFactory { fail_first: Mutex::new(false) });
		let selection = ChannelSelectionStream::connect(vec![], Arc::new(NoDnsResolver), factory, false);

		for _ in 0..50 {
			if selection.info().link_state == LinkState::LinkError {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(selection.info().link_state, LinkState::LinkError);
	}
}
