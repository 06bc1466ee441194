//! The `ByteStream` abstraction every transport, gate and channel in this
//! workspace is built against (`spec.md` §2 C3, §3, §4.2). Grounded on
//! `wind_core::{AbstractTcpStream, io::AsyncReadWrite}` for the "a stream is
//! just something you can push bytes into and get bytes out of" shape, but
//! reworked from a raw `AsyncRead + AsyncWrite` pair into an explicit
//! write-call/event-driven-read pair: `spec.md` §4.2 describes reads as
//! pushed to subscribers through `out_data_event` rather than pulled through
//! a `poll_read`, so gates can be chained without each one owning a read
//! buffer of its own.

use std::fmt;

use bytes::Bytes;

use crate::{error::CoreResult, event::EventSource};

/// Connectivity state of a [`ByteStream`], surfaced through
/// [`ByteStream::stream_update_event`] (`spec.md` §3 `StreamInfo.link_state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
	/// No transport attached yet.
	Unlinked,
	/// A transport build or reconnect is in progress (`spec.md` §4.4
	/// `TransportBuilderAction`).
	Linking,
	/// Usable for both directions.
	Linked,
	/// Torn down and not self-healing; a new stream (or `restream()`) is
	/// required (`spec.md` §4.4, §7 "Byte-stream-level errors flip
	/// `stream_info.link_state` to `link-error`").
	LinkError,
}

/// Snapshot of a stream's framing limits, reliability, and link/backpressure
/// state, re-emitted whenever any field changes (`spec.md` §3 `StreamInfo`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
	/// Recommended single-write payload size for this stream (e.g. link MTU
	/// minus framing overhead).
	pub rec_element_size: u32,
	/// Maximum payload a single `write()` call may carry before the stream
	/// refuses or fragments it. `u32::MAX` means effectively unbounded.
	pub max_element_size: u32,
	/// Whether the underlying link guarantees in-order, non-duplicated
	/// delivery without a safe-stream (C7) layered on top.
	pub is_reliable: bool,
	pub link_state: LinkState,
	/// `false` while the stream is applying backpressure (e.g. a
	/// [`BufferStream`](https://docs.rs/aether-stream)'s queue is full);
	/// `write()` calls are still accepted but may be refused or queued
	/// longer (`spec.md` §5 "Resource policy").
	pub is_writable: bool,
}

impl StreamInfo {
	pub const fn unlinked() -> Self {
		Self {
			rec_element_size: 0,
			max_element_size: 0,
			is_reliable: false,
			link_state: LinkState::Unlinked,
			is_writable: false,
		}
	}

	pub const fn linking() -> Self {
		Self {
			link_state: LinkState::Linking,
			..Self::unlinked()
		}
	}
}

/// A bidirectional, message-oriented byte pipe (`spec.md` §4.2 C3). Every
/// transport driver (C4), gate (C6) and channel (C5) in this workspace
/// implements or wraps one.
///
/// Writes are explicit calls; reads are pushed to subscribers of
/// [`out_data_event`](Self::out_data_event) as they arrive, rather than
/// pulled — this lets a chain of gates (crypto, framing, safe-stream) each
/// subscribe to the gate beneath them without juggling a shared read buffer.
pub trait ByteStream: Send {
	/// Submits `data` for transmission. Returns once the stream has accepted
	/// responsibility for `data` (queued or sent), not once it is
	/// acknowledged by the peer — acknowledgement, if the stream layer cares,
	/// is a safe-stream (C7) concern layered on top.
	fn write(&mut self, data: Bytes) -> CoreResult<()>;

	/// Fires on every inbound payload, already gated/decrypted/deframed by
	/// whatever wraps this stream (`spec.md` §4.2).
	fn out_data_event(&self) -> &EventSource<Bytes>;

	/// Fires whenever [`StreamInfo`] changes, most commonly on a link state
	/// transition (`spec.md` §4.2, §4.4).
	fn stream_update_event(&self) -> &EventSource<StreamInfo>;

	fn info(&self) -> StreamInfo;

	/// Forces the stream to tear down and re-establish its underlying link
	/// (`spec.md` §4.2 "restream signal"). A gate that holds per-connection
	/// cryptographic state (a `CryptoGate`'s nonce counter, per `spec.md` §9's
	/// resolved Open Question) MUST rotate that state before the next
	/// encrypt rather than resume the old counter against a new peer socket.
	fn restream(&mut self) {}
}

/// Thin in-process loopback pair used by tests and the bin crate's demo
/// wiring to exercise gates and channel selection without a real transport
/// underneath (`spec.md` §4.2's "a stream is whatever the layer above needs
/// it to be" — here, a pair of queues).
pub struct LoopbackStream {
	/// What `out_data_event()` on this side delivers — fed by the peer's
	/// `write()`.
	inbound: std::sync::Arc<EventSource<Bytes>>,
	/// The peer's `inbound`, fed by this side's `write()`.
	peer_inbound: std::sync::Arc<EventSource<Bytes>>,
	update: EventSource<StreamInfo>,
	info: StreamInfo,
}

impl fmt::Debug for LoopbackStream {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LoopbackStream").field("info", &self.info).finish()
	}
}

impl LoopbackStream {
	/// Builds a connected pair: writes to one side arrive as `out_data_event`
	/// on the other.
	pub fn pair() -> (Self, Self) {
		let a_inbound = std::sync::Arc::new(EventSource::new());
		let b_inbound = std::sync::Arc::new(EventSource::new());
		let info = StreamInfo {
			rec_element_size: u32::MAX,
			max_element_size: u32::MAX,
			is_reliable: true,
			link_state: LinkState::Linked,
			is_writable: true,
		};
		let a = Self {
			inbound: a_inbound.clone(),
			peer_inbound: b_inbound.clone(),
			update: EventSource::new(),
			info,
		};
		let b = Self {
			inbound: b_inbound,
			peer_inbound: a_inbound,
			update: EventSource::new(),
			info,
		};
		(a, b)
	}
}

impl ByteStream for LoopbackStream {
	fn write(&mut self, data: Bytes) -> CoreResult<()> {
		self.peer_inbound.emit(&data);
		Ok(())
	}

	fn out_data_event(&self) -> &EventSource<Bytes> {
		&self.inbound
	}

	fn stream_update_event(&self) -> &EventSource<StreamInfo> {
		&self.update
	}

	fn info(&self) -> StreamInfo {
		self.info
	}
}

/// Helper for gates that need to reject an oversized write up front rather
/// than truncate or fragment it silently (`spec.md` §8 property: "a gate
/// never silently drops data").
pub fn check_max_element_size(info: &StreamInfo, len: usize, what: &'static str) -> CoreResult<()> {
	if info.max_element_size != u32::MAX && len > info.max_element_size as usize {
		return crate::error::ProtocolViolationSnafu {
			reason: format!("{what} of {len} bytes exceeds max element size {}", info.max_element_size),
		}
		.fail();
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn loopback_pair_delivers_writes_to_peer() {
		let (mut a, b) = LoopbackStream::pair();
		let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
		let r = received.clone();
		let _sub = b.out_data_event().subscribe(move |data: &Bytes| {
			r.lock().unwrap().push(data.clone());
		});

		a.write(Bytes::from_static(b"hello")).unwrap();
		assert_eq!(received.lock().unwrap().as_slice(), [Bytes::from_static(b"hello")]);
	}

	#[test]
	fn stream_info_reports_linked_link_state() {
		let (a, _b) = LoopbackStream::pair();
		assert_eq!(a.info().link_state, LinkState::Linked);
		assert!(a.info().is_writable);
	}

	#[test]
	fn unlinked_info_is_not_writable() {
		let info = StreamInfo::unlinked();
		assert_eq!(info.link_state, LinkState::Unlinked);
		assert!(!info.is_writable);
	}
}
