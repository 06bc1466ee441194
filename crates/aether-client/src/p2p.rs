//! P2P message stream manager (`spec.md` §2 C10, §4.8): per-peer virtual
//! [`ByteStream`]s layered on top of the server-connection pool, routing
//! outbound writes through [`AuthorizedApi::send_message`] and fanning
//! inbound `send_message` calls (delivered via each connection's
//! [`ClientApiSafe`]) out to whichever peer streams are listening.

use std::{
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, Ordering},
	},
	time::Duration,
};

use aether_core::{
	error::{CoreResult, TransportFailureSnafu},
	event::{EventSource, Subscription},
	stream::{ByteStream, LinkState, StreamInfo},
	types::{AeMessage, Uid},
};
use aether_stream::{SafeStream, SafeStreamConfig};
use bytes::Bytes;
use moka::sync::Cache;

use crate::server::{RequestPolicy, ServerConnectionManager};

/// A per-peer virtual stream (`spec.md` §3 `MessageStream`). Cheap to clone:
/// every clone shares the same inbound mailbox, so opening a peer's stream
/// twice still delivers every inbound message to both handles.
#[derive(Clone)]
pub struct P2pStream {
	peer: Uid,
	manager: Arc<ServerConnectionManager>,
	mailbox: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
}

impl P2pStream {
	pub fn peer(&self) -> Uid {
		self.peer
	}
}

impl ByteStream for P2pStream {
	fn write(&mut self, data: Bytes) -> CoreResult<()> {
		self.manager
			.send_message(RequestPolicy::Priority { index: 0 }, AeMessage { uid: self.peer, data })
			.map_err(|err| TransportFailureSnafu { reason: err.to_string() }.build())
	}

	fn out_data_event(&self) -> &EventSource<Bytes> {
		&self.mailbox
	}

	fn stream_update_event(&self) -> &EventSource<StreamInfo> {
		&self.update
	}

	fn info(&self) -> StreamInfo {
		let link_state = if self.manager.default_connection().is_ok() { LinkState::Linked } else { LinkState::LinkError };
		StreamInfo {
			rec_element_size: 1200,
			max_element_size: u32::MAX,
			is_reliable: false,
			link_state,
			is_writable: link_state == LinkState::Linked,
		}
	}
}

/// Wraps a [`P2pStream`] in the safe-stream reliability layer (C7) for
/// callers that need in-order, acknowledged delivery over the inherently
/// unreliable (fire-and-forget `send_message`) P2P layer (`spec.md` §4.8:
/// "delivers inbound messages tagged with sender UID", with ordering left to
/// whatever sits above it).
pub fn reliable_stream(stream: P2pStream, config: SafeStreamConfig) -> SafeStream {
	SafeStream::new(Box::new(stream), config)
}

/// Upper bound on distinct peers with a live mailbox at once; beyond this,
/// least-recently-used peers are evicted (`spec.md` §5 "Resource policy" —
/// unbounded per-peer state is exactly the kind of growth that policy caps).
const MAX_TRACKED_PEERS: u64 = 10_000;

/// Peers idle this long (no inbound message, no `stream_for` lookup) are
/// evicted from the mailbox cache; a fresh [`P2pStream`] (and a fresh
/// `new_stream_event`) is created for them on the next contact.
const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Creates and looks up per-peer [`P2pStream`]s, firing [`Self::new_stream_event`]
/// the first time a peer is seen — either by an inbound `send_message` or by
/// an application-initiated [`Self::stream_for`] call (`spec.md` §3
/// `ClientMessageStreamManager`). The mailbox table is a bounded, idle-evicting
/// [`moka::sync::Cache`], the same crate (if not the same async flavor)
/// `wind_tuic::outbound::TuicOutbound` uses for its session table — this one
/// is `sync` rather than `future` because every access here runs synchronously
/// off an event callback, not inside an `async fn`.
pub struct ClientMessageStreamManager {
	connections: Arc<ServerConnectionManager>,
	mailboxes: Cache<Uid, Arc<EventSource<Bytes>>>,
	new_stream_event: EventSource<P2pStream>,
	_subs: Mutex<Vec<Subscription>>,
}

impl ClientMessageStreamManager {
	pub fn new(connections: Arc<ServerConnectionManager>) -> Arc<Self> {
		let manager = Arc::new(Self {
			connections,
			mailboxes: Cache::builder().max_capacity(MAX_TRACKED_PEERS).time_to_idle(PEER_IDLE_TIMEOUT).build(),
			new_stream_event: EventSource::new(),
			_subs: Mutex::new(Vec::new()),
		});

		let subs = manager
			.connections
			.connections()
			.iter()
			.map(|connection| {
				let manager = manager.clone();
				connection
					.client_api_safe()
					.send_message_event()
					.subscribe(move |message: &AeMessage| manager.deliver(message))
			})
			.collect();
		*manager._subs.lock().unwrap() = subs;

		manager
	}

	pub fn new_stream_event(&self) -> &EventSource<P2pStream> {
		&self.new_stream_event
	}

	/// Returns the peer's stream, creating (and announcing) it on first use.
	/// `Cache::get_with` only runs the init closure on a miss — including
	/// under concurrent lookups for the same peer — so `created` is set at
	/// most once per fresh mailbox.
	pub fn stream_for(self: &Arc<Self>, peer: Uid) -> P2pStream {
		let created = AtomicBool::new(false);
		let mailbox = self.mailboxes.get_with(peer, || {
			created.store(true, Ordering::SeqCst);
			Arc::new(EventSource::new())
		});

		let stream = P2pStream {
			peer,
			manager: self.connections.clone(),
			mailbox,
			update: Arc::new(EventSource::new()),
		};
		if created.load(Ordering::SeqCst) {
			self.new_stream_event.emit(&stream);
		}
		stream
	}

	fn deliver(self: &Arc<Self>, message: &AeMessage) {
		let stream = self.stream_for(message.uid);
		stream.mailbox.emit(&message.data);
	}
}

#[cfg(test)]
mod test {
	use aether_core::types::AeMessage;

	use super::*;

	fn message(peer: Uid, data: &'static [u8]) -> AeMessage {
		AeMessage { uid: peer, data: Bytes::from_static(data) }
	}

	#[tokio::test]
	async fn stream_for_creates_once_and_shares_the_mailbox() {
		let manager = ClientMessageStreamManager::new(ServerConnectionManager::new(Default::default()));
		let peer = Uid::from_bytes([3u8; 16]);

		let first = manager.clone().stream_for(peer);
		let second = manager.clone().stream_for(peer);

		let received = Arc::new(Mutex::new(Vec::new()));
		let recorder = received.clone();
		let _sub = second.out_data_event().subscribe(move |data: &Bytes| recorder.lock().unwrap().push(data.clone()));

		manager.deliver(&message(peer, b"hello"));
		assert_eq!(*received.lock().unwrap(), vec![Bytes::from_static(b"hello")]);
		assert_eq!(first.peer(), peer);
	}

	#[tokio::test]
	async fn new_stream_event_fires_once_per_peer() {
		let manager = ClientMessageStreamManager::new(ServerConnectionManager::new(Default::default()));
		let peer = Uid::from_bytes([4u8; 16]);
		let announcements = Arc::new(Mutex::new(0));
		let counter = announcements.clone();
		let _sub = manager.new_stream_event().subscribe(move |_: &P2pStream| *counter.lock().unwrap() += 1);

		manager.deliver(&message(peer, b"a"));
		manager.deliver(&message(peer, b"b"));
		assert_eq!(*announcements.lock().unwrap(), 1);
	}

	#[tokio::test]
	async fn write_without_an_authorized_connection_is_rejected() {
		let manager = ClientMessageStreamManager::new(ServerConnectionManager::new(Default::default()));
		let mut stream = manager.stream_for(Uid::from_bytes([5u8; 16]));
		assert!(stream.write(Bytes::from_static(b"x")).is_err());
	}
}
