//! Safe-stream (`spec.md` §2 C7, §4.5): an ordered, at-least-once-with-dedup
//! byte stream layered over any unreliable or datagram-oriented
//! [`ByteStream`]. Grounded in the shape of `wind-tuic`'s `UdpStream`
//! fragment-reassembly cache (`proto/udp_stream.rs`): buffer out-of-order
//! arrivals until the front is contiguous, then drain — generalized here
//! from UDP fragment reassembly to arbitrary chunk retransmission with RTO
//! estimation.
//!
//! Retransmit timers and the idle-ack fallback need a clock, which a purely
//! event-reactive gate (`crate::gate`) doesn't have; this module owns a
//! background `tokio` task for that, the same way `aether-transport`'s
//! socket drivers own one for their read loop.

use std::{
	collections::{BTreeMap, VecDeque},
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, Ordering},
	},
	time::{Duration, Instant},
};

use aether_core::{
	error::{BackpressureSnafu, CoreResult},
	event::{EventSource, Subscription},
	stream::{ByteStream, LinkState, StreamInfo},
	wire::{decode_tiered, encode_tiered},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::task::JoinHandle;

use crate::error::{ProtocolViolationSnafu, RetriesExhaustedSnafu};

/// `spec.md` §3 `SafeStreamConfig`. `rto_grow_factor` defaults to
/// `AE_SAFE_STREAM_RTO_GROW_FACTOR` (`spec.md` §6).
#[derive(Debug, Clone, Copy)]
pub struct SafeStreamConfig {
	/// Max whole writes (post-chunking pieces) held before `write()` refuses
	/// with backpressure.
	pub buffer_capacity: usize,
	pub max_repeat_count: u32,
	pub max_data_size: usize,
	pub window_size: usize,
	pub wait_confirm_timeout: Duration,
	pub send_confirm_timeout: Duration,
	pub send_repeat_timeout: Duration,
	pub rto_grow_factor: f64,
}

impl Default for SafeStreamConfig {
	fn default() -> Self {
		Self {
			buffer_capacity: 256,
			max_repeat_count: 5,
			max_data_size: 1200,
			window_size: 100,
			wait_confirm_timeout: Duration::from_millis(10_000),
			send_confirm_timeout: Duration::from_millis(200),
			send_repeat_timeout: Duration::from_millis(300),
			rto_grow_factor: 1.5,
		}
	}
}

/// `spec.md` §4.5 "Framing": `kind ∈ {Data, Ack, Nack, Heartbeat, Reset}`.
/// Round-trips through `num_enum`, the same derive pair `aether_core::types::Protocol`
/// uses for its wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum ChunkKind {
	Data = 0,
	Ack = 1,
	Nack = 2,
	Heartbeat = 3,
	Reset = 4,
}

impl ChunkKind {
	fn tag(self) -> u8 {
		self.into()
	}

	fn from_tag(tag: u8) -> crate::error::StreamResult<Self> {
		ChunkKind::try_from_primitive(tag).map_err(|_| {
			ProtocolViolationSnafu {
				reason: format!("unknown safe-stream chunk kind {tag}"),
			}
			.build()
		})
	}
}

/// `{kind, seq, payload_len}` (`spec.md` §4.5 "Framing"). Only `Data` chunks
/// carry a payload; the rest use `seq` as their sole argument (the acked
/// seq for `Ack`, the requested seq for `Nack`, unused for
/// `Heartbeat`/`Reset`).
fn encode_chunk(kind: ChunkKind, seq: u16, payload: Option<&[u8]>) -> Bytes {
	let mut buf = BytesMut::with_capacity(3 + payload.map_or(0, |p| p.len() + 5));
	buf.put_u8(kind.tag());
	buf.put_u16_le(seq);
	if let Some(payload) = payload {
		// encode_tiered only fails on a value no in-process payload reaches.
		let _ = encode_tiered(payload.len() as u64, &mut buf);
		buf.extend_from_slice(payload);
	}
	buf.freeze()
}

fn decode_chunk(data: &Bytes) -> crate::error::StreamResult<(ChunkKind, u16, Option<Bytes>)> {
	if data.len() < 3 {
		return ProtocolViolationSnafu {
			reason: format!("safe-stream chunk of {} bytes shorter than its header", data.len()),
		}
		.fail();
	}
	let kind = ChunkKind::from_tag(data[0])?;
	let seq = u16::from_le_bytes([data[1], data[2]]);
	if kind != ChunkKind::Data {
		return Ok((kind, seq, None));
	}
	let mut rest = data.slice(3..);
	let len = match decode_tiered(&mut rest)? {
		Some(len) => len as usize,
		None => {
			return ProtocolViolationSnafu {
				reason: "Data chunk missing its length prefix".to_string(),
			}
			.fail();
		}
	};
	if rest.len() < len {
		return ProtocolViolationSnafu {
			reason: format!("Data chunk declares {len} bytes but only {} are present", rest.len()),
		}
		.fail();
	}
	Ok((kind, seq, Some(rest.slice(..len))))
}

/// `(a - b) mod 2^16 in (0, 2^15)` (`spec.md` §4.5 "circular comparisons").
fn is_after(a: u16, b: u16) -> bool {
	let diff = a.wrapping_sub(b);
	diff != 0 && diff < 0x8000
}

fn is_after_or_eq(a: u16, b: u16) -> bool {
	a == b || is_after(a, b)
}

fn split_into_chunks(data: &Bytes, max_len: usize) -> Vec<Bytes> {
	if data.is_empty() {
		return vec![Bytes::new()];
	}
	let mut pieces = Vec::with_capacity(data.len().div_ceil(max_len));
	let mut offset = 0;
	while offset < data.len() {
		let end = (offset + max_len).min(data.len());
		pieces.push(data.slice(offset..end));
		offset = end;
	}
	pieces
}

struct UnackedChunk {
	seq: u16,
	data: Bytes,
	deadline: Instant,
	rto: Duration,
	repeat_count: u32,
}

struct SendSide {
	next_seq: u16,
	window: VecDeque<UnackedChunk>,
	pending: VecDeque<Bytes>,
	rto_estimate: Duration,
}

struct RecvSide {
	next_expected: u16,
	reorder: BTreeMap<u16, Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
	Fresh,
	Running,
	Failed,
	Closed,
}

struct Shared {
	send: Mutex<SendSide>,
	recv: Mutex<RecvSide>,
	state: Mutex<StreamState>,
	config: SafeStreamConfig,
}

type InnerStream = Arc<Mutex<Box<dyn ByteStream>>>;

fn try_fill_window(shared: &Arc<Shared>, inner: &InnerStream) {
	loop {
		let next = {
			let mut send = shared.send.lock().unwrap();
			if send.window.len() >= shared.config.window_size {
				break;
			}
			let Some(payload) = send.pending.pop_front() else {
				break;
			};
			let seq = send.next_seq;
			send.next_seq = send.next_seq.wrapping_add(1);
			let rto = send.rto_estimate;
			send.window.push_back(UnackedChunk {
				seq,
				data: payload.clone(),
				deadline: Instant::now() + rto,
				rto,
				repeat_count: 0,
			});
			(seq, payload)
		};
		let (seq, payload) = next;
		let framed = encode_chunk(ChunkKind::Data, seq, Some(&payload));
		if let Err(err) = inner.lock().unwrap().write(framed) {
			tracing::warn!(%err, seq, "SafeStream: initial send failed");
		}
	}
	*shared.state.lock().unwrap() = StreamState::Running;
}

fn handle_ack(shared: &Arc<Shared>, acked_seq: u16) {
	let mut send = shared.send.lock().unwrap();
	let now = Instant::now();
	while let Some(front) = send.window.front() {
		if !is_after_or_eq(acked_seq, front.seq) {
			break;
		}
		let chunk = send.window.pop_front().unwrap();
		if chunk.repeat_count == 0 {
			// Only clean (non-retransmitted) samples feed the RTO estimator,
			// the usual Karn's-algorithm caveat against ambiguous RTT samples.
			let deadline_started = chunk.deadline - chunk.rto;
			let rtt = now.saturating_duration_since(deadline_started);
			let blended = send.rto_estimate.mul_f64(0.75) + rtt.mul_f64(0.25);
			send.rto_estimate = blended.max(Duration::from_millis(10));
		}
	}
}

fn force_retransmit(shared: &Arc<Shared>, inner: &InnerStream, seq: u16) {
	let target = {
		let send = shared.send.lock().unwrap();
		send.window.iter().find(|c| c.seq == seq).map(|c| c.data.clone())
	};
	if let Some(data) = target {
		let framed = encode_chunk(ChunkKind::Data, seq, Some(&data));
		if let Err(err) = inner.lock().unwrap().write(framed) {
			tracing::warn!(%err, seq, "SafeStream: nack-triggered retransmit failed");
		}
	}
}

fn send_ack(shared: &Arc<Shared>, inner: &InnerStream, acked_seq: u16) {
	let framed = encode_chunk(ChunkKind::Ack, acked_seq, None);
	if let Err(err) = inner.lock().unwrap().write(framed) {
		tracing::warn!(%err, "SafeStream: failed to send ack");
	}
}

fn handle_incoming(shared: &Arc<Shared>, inner: &InnerStream, out_data: &Arc<EventSource<Bytes>>, chunk: &Bytes) {
	let (kind, seq, payload) = match decode_chunk(chunk) {
		Ok(v) => v,
		Err(err) => {
			tracing::warn!(%err, "SafeStream: dropping malformed chunk");
			return;
		}
	};

	match kind {
		ChunkKind::Reset => {
			*shared.state.lock().unwrap() = StreamState::Closed;
		}
		ChunkKind::Heartbeat => {}
		ChunkKind::Ack => handle_ack(shared, seq),
		ChunkKind::Nack => force_retransmit(shared, inner, seq),
		ChunkKind::Data => {
			let Some(payload) = payload else { return };
			let (is_duplicate, highest_contig) = {
				let mut recv = shared.recv.lock().unwrap();
				if seq == recv.next_expected {
					out_data.emit(&payload);
					recv.next_expected = recv.next_expected.wrapping_add(1);
					while let Some(next_payload) = recv.reorder.remove(&recv.next_expected) {
						out_data.emit(&next_payload);
						recv.next_expected = recv.next_expected.wrapping_add(1);
					}
					(false, recv.next_expected.wrapping_sub(1))
				} else if is_after(seq, recv.next_expected)
					&& (seq.wrapping_sub(recv.next_expected) as usize) < shared.config.window_size
				{
					let duplicate = recv.reorder.contains_key(&seq);
					recv.reorder.insert(seq, payload);
					(duplicate, recv.next_expected.wrapping_sub(1))
				} else {
					// Already delivered (before next_expected) or beyond the
					// window: drop, but an already-delivered repeat still
					// triggers the fast-recover ack the peer is waiting on.
					(!is_after(seq, recv.next_expected), recv.next_expected.wrapping_sub(1))
				}
			};
			if is_duplicate {
				send_ack(shared, inner, highest_contig);
			} else {
				send_ack(shared, inner, highest_contig);
			}
		}
	}
}

fn tick(shared: &Arc<Shared>, inner: &InnerStream) {
	let now = Instant::now();
	let mut to_retransmit = Vec::new();
	let mut failed = Vec::new();
	{
		let mut send = shared.send.lock().unwrap();
		for chunk in send.window.iter_mut() {
			if now < chunk.deadline {
				continue;
			}
			chunk.repeat_count += 1;
			if chunk.repeat_count > shared.config.max_repeat_count {
				failed.push(chunk.seq);
				continue;
			}
			chunk.rto = chunk.rto.mul_f64(shared.config.rto_grow_factor).min(Duration::from_secs(30));
			chunk.deadline = now + chunk.rto;
			to_retransmit.push((chunk.seq, chunk.data.clone()));
		}
	}
	for (seq, data) in to_retransmit {
		let framed = encode_chunk(ChunkKind::Data, seq, Some(&data));
		if let Err(err) = inner.lock().unwrap().write(framed) {
			tracing::warn!(%err, seq, "SafeStream: retransmit failed");
		}
	}
	if let Some(&seq) = failed.first() {
		let err = RetriesExhaustedSnafu {
			seq,
			attempts: shared.config.max_repeat_count,
		}
		.build();
		tracing::error!(%err, failed_count = failed.len(), "SafeStream: giving up, flagging link error");
		*shared.state.lock().unwrap() = StreamState::Failed;
		let mut send = shared.send.lock().unwrap();
		send.window.clear();
		send.pending.clear();
	}
}

/// Reliability layer over any [`ByteStream`] (`spec.md` §4.5). `write()`
/// chunks and enqueues immediately; delivery, retransmission and
/// acknowledgement run on a background task since RTO timers need a clock a
/// purely subscribe-driven gate doesn't have.
pub struct SafeStream {
	inner: InnerStream,
	shared: Arc<Shared>,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	errored: Arc<AtomicBool>,
	_data_sub: Subscription,
	_update_sub: Subscription,
	task: JoinHandle<()>,
}

impl SafeStream {
	pub fn new(inner: Box<dyn ByteStream>, config: SafeStreamConfig) -> Self {
		let shared = Arc::new(Shared {
			send: Mutex::new(SendSide {
				next_seq: 0,
				window: VecDeque::new(),
				pending: VecDeque::new(),
				rto_estimate: config.send_repeat_timeout,
			}),
			recv: Mutex::new(RecvSide {
				next_expected: 0,
				reorder: BTreeMap::new(),
			}),
			state: Mutex::new(StreamState::Fresh),
			config,
		});

		let out_data = Arc::new(EventSource::new());
		let update = Arc::new(EventSource::new());
		let errored = Arc::new(AtomicBool::new(false));

		let inner: InnerStream = Arc::new(Mutex::new(inner));

		let data_sub = {
			let guard = inner.lock().unwrap();
			let forward = out_data.clone();
			let recv_shared = shared.clone();
			let recv_inner = inner.clone();
			guard
				.out_data_event()
				.subscribe(move |chunk: &Bytes| handle_incoming(&recv_shared, &recv_inner, &forward, chunk))
		};

		let update_sub = {
			let guard = inner.lock().unwrap();
			let forward = update.clone();
			let errored_fwd = errored.clone();
			guard.stream_update_event().subscribe(move |info: &StreamInfo| {
				if info.link_state == LinkState::LinkError {
					errored_fwd.store(true, Ordering::SeqCst);
				}
				forward.emit(info);
			})
		};

		let task_shared = shared.clone();
		let task_inner = inner.clone();
		let task = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(Duration::from_millis(50));
			loop {
				ticker.tick().await;
				tick(&task_shared, &task_inner);
			}
		});

		Self {
			inner,
			shared,
			out_data,
			update,
			errored,
			_data_sub: data_sub,
			_update_sub: update_sub,
			task,
		}
	}
}

impl ByteStream for SafeStream {
	fn write(&mut self, data: Bytes) -> CoreResult<()> {
		{
			let mut send = self.shared.send.lock().unwrap();
			if send.pending.len() + send.window.len() >= self.shared.config.buffer_capacity {
				return BackpressureSnafu {
					buffered: send.pending.len() + send.window.len(),
					capacity: self.shared.config.buffer_capacity,
				}
				.fail();
			}
			for piece in split_into_chunks(&data, self.shared.config.max_data_size) {
				send.pending.push_back(piece);
			}
		}
		try_fill_window(&self.shared, &self.inner);
		Ok(())
	}

	fn out_data_event(&self) -> &EventSource<Bytes> {
		&self.out_data
	}

	fn stream_update_event(&self) -> &EventSource<StreamInfo> {
		&self.update
	}

	fn info(&self) -> StreamInfo {
		let mut info = self.inner.lock().unwrap().info();
		info.is_reliable = true;
		info.rec_element_size = self.shared.config.max_data_size as u32;
		let state = *self.shared.state.lock().unwrap();
		if matches!(state, StreamState::Failed | StreamState::Closed) || self.errored.load(Ordering::SeqCst) {
			info.link_state = LinkState::LinkError;
			info.is_writable = false;
		}
		info
	}

	fn restream(&mut self) {
		*self.shared.state.lock().unwrap() = StreamState::Fresh;
		self.errored.store(false, Ordering::SeqCst);
		{
			let mut send = self.shared.send.lock().unwrap();
			send.window.clear();
			send.pending.clear();
			send.next_seq = 0;
			send.rto_estimate = self.shared.config.send_repeat_timeout;
		}
		{
			let mut recv = self.shared.recv.lock().unwrap();
			recv.next_expected = 0;
			recv.reorder.clear();
		}
		self.inner.lock().unwrap().restream();
	}
}

impl Drop for SafeStream {
	fn drop(&mut self) {
		self.task.abort();
	}
}
