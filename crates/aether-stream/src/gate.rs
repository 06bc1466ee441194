//! Stream composition gates (`spec.md` §2 C6, §4.2): filters that wrap a
//! [`ByteStream`] and transform bytes in one or both directions. Composition
//! is just nesting — a gate owns the `Box<dyn ByteStream>` beneath it and is
//! itself a `ByteStream`, so any chain (`Sized(Crypto(AddHeader(tcp)))`)
//! reads the same way it is built.
//!
//! Grounded on `original_source/aether/stream_api/{serialize_gate,
//! sized_packet_gate,header_gate}.h`: each header describes one gate with a
//! write-side transform, a read-side inverse, and an `Overhead()` the layer
//! above uses to keep under `max_element_size`.

use std::sync::Arc;

use aether_core::{
	error::{BackpressureSnafu, CoreResult, ProtocolViolationSnafu as CoreProtocolViolationSnafu},
	event::{EventSource, Subscription},
	stream::{ByteStream, LinkState, StreamInfo},
	wire::{WireDecode, WireEncode, decode_tiered, encode_tiered, tiered_len},
};
use bytes::{Buf, Bytes, BytesMut};
use chacha20poly1305::{
	ChaCha20Poly1305, Nonce,
	aead::{AeadInPlace, KeyInit},
};

use crate::error::{CryptoSnafu, ProtocolViolationSnafu, StreamResult};

/// Key material collaborator for [`CryptoGate`] (`spec.md` §4.2
/// "`IEncryptProvider` / `IDecryptProvider`"). Nonce management is entirely
/// the gate's concern; the provider only ever hands back the symmetric key.
pub trait KeyProvider: Send + Sync {
	fn symmetric_key(&self) -> [u8; 32];
}

/// A [`KeyProvider`] over a key fixed at construction time, for tests and for
/// clients whose `ClientConfig::master_key` never rotates mid-session.
pub struct StaticKeyProvider(pub [u8; 32]);

impl KeyProvider for StaticKeyProvider {
	fn symmetric_key(&self) -> [u8; 32] {
		self.0
	}
}

fn shrink(mut info: StreamInfo, overhead: u32) -> StreamInfo {
	if info.max_element_size != u32::MAX {
		info.max_element_size = info.max_element_size.saturating_sub(overhead);
	}
	if info.rec_element_size != u32::MAX {
		info.rec_element_size = info.rec_element_size.saturating_sub(overhead);
	}
	info
}

/// Prepends a fixed byte sequence to every outbound write and strips it back
/// off on read (`spec.md` §4.2 "prepends a fixed header on each write
/// (stateless)"). A chunk shorter than the header is a protocol violation;
/// rather than being silently dropped (`spec.md` §8: "a gate never silently
/// drops data"), it flips `stream_info.link_state` to `link-error` and fires
/// `stream_update_event`, the same propagation `spec.md` §7 requires for
/// every byte-stream-level error — mirroring how [`CryptoGate`] surfaces a
/// failed AEAD decrypt below.
pub struct AddHeaderGate {
	inner: Box<dyn ByteStream>,
	header: Bytes,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	errored: Arc<std::sync::atomic::AtomicBool>,
	_data_sub: Subscription,
	_update_sub: Subscription,
}

impl AddHeaderGate {
	pub fn new(mut inner: Box<dyn ByteStream>, header: Bytes) -> Self {
		let out_data = Arc::new(EventSource::new());
		let update = Arc::new(EventSource::new());
		let errored = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let header_len = header.len();

		let forward = out_data.clone();
		let errored_recv = errored.clone();
		let update_on_error = update.clone();
		let data_sub = inner.out_data_event().subscribe(move |data: &Bytes| {
			if data.len() < header_len {
				tracing::warn!(len = data.len(), header_len, "AddHeaderGate: frame shorter than header, flagging link error");
				errored_recv.store(true, std::sync::atomic::Ordering::SeqCst);
				update_on_error.emit(&StreamInfo {
					link_state: LinkState::LinkError,
					is_writable: false,
					..StreamInfo::unlinked()
				});
				return;
			}
			forward.emit(&data.slice(header_len..));
		});

		let update_forward = update.clone();
		let update_sub = inner.stream_update_event().subscribe(move |info: &StreamInfo| {
			update_forward.emit(&shrink(*info, header_len as u32));
		});

		Self {
			inner,
			header,
			out_data,
			update,
			errored,
			_data_sub: data_sub,
			_update_sub: update_sub,
		}
	}

	pub fn overhead(&self) -> u32 {
		self.header.len() as u32
	}
}

impl ByteStream for AddHeaderGate {
	fn write(&mut self, data: Bytes) -> CoreResult<()> {
		let mut framed = BytesMut::with_capacity(self.header.len() + data.len());
		framed.extend_from_slice(&self.header);
		framed.extend_from_slice(&data);
		self.inner.write(framed.freeze())
	}

	fn out_data_event(&self) -> &EventSource<Bytes> {
		&self.out_data
	}

	fn stream_update_event(&self) -> &EventSource<StreamInfo> {
		&self.update
	}

	fn info(&self) -> StreamInfo {
		let mut info = shrink(self.inner.info(), self.overhead());
		if self.errored.load(std::sync::atomic::Ordering::SeqCst) {
			info.link_state = LinkState::LinkError;
			info.is_writable = false;
		}
		info
	}

	fn restream(&mut self) {
		self.errored.store(false, std::sync::atomic::Ordering::SeqCst);
		self.inner.restream();
	}
}

/// Buffers partial reads and prefixes every write with a tiered-int size
/// field (`spec.md` §4.2 "`SizedPacketGate`", §8 scenario S5). Reassembly is
/// malformed-prefix-tolerant: a bad length marker resets the accumulator
/// instead of treating the whole stream as dead, the same policy
/// `aether-transport`'s frame reassembly uses.
pub struct SizedPacketGate {
	inner: Box<dyn ByteStream>,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	_data_sub: Subscription,
	_update_sub: Subscription,
}

impl SizedPacketGate {
	pub fn new(mut inner: Box<dyn ByteStream>) -> Self {
		let out_data = Arc::new(EventSource::new());
		let update = Arc::new(EventSource::new());

		let forward = out_data.clone();
		let recv_buf = Arc::new(std::sync::Mutex::new(BytesMut::new()));
		let data_sub = inner.out_data_event().subscribe(move |chunk: &Bytes| {
			let mut buf = recv_buf.lock().unwrap();
			buf.extend_from_slice(chunk);
			loop {
				let mut cursor = Bytes::copy_from_slice(&buf[..]);
				match decode_tiered(&mut cursor) {
					Ok(Some(len)) => {
						let consumed_prefix = buf.len() - cursor.len();
						let len = len as usize;
						if cursor.len() < len {
							break; // frame not fully arrived yet
						}
						let payload = cursor.split_to(len);
						buf.advance(consumed_prefix + len);
						forward.emit(&payload);
					}
					Ok(None) => break, // prefix itself not fully arrived yet
					Err(_) => {
						tracing::warn!("SizedPacketGate: malformed length prefix, resetting buffer");
						buf.clear();
						break;
					}
				}
			}
		});

		let update_forward = update.clone();
		let update_sub = inner.stream_update_event().subscribe(move |info: &StreamInfo| {
			update_forward.emit(info);
		});

		Self {
			inner,
			out_data,
			update,
			_data_sub: data_sub,
			_update_sub: update_sub,
		}
	}
}

impl ByteStream for SizedPacketGate {
	fn write(&mut self, data: Bytes) -> CoreResult<()> {
		let mut framed = BytesMut::with_capacity(tiered_len(data.len() as u64) + data.len());
		encode_tiered(data.len() as u64, &mut framed)?;
		framed.extend_from_slice(&data);
		self.inner.write(framed.freeze())
	}

	fn out_data_event(&self) -> &EventSource<Bytes> {
		&self.out_data
	}

	fn stream_update_event(&self) -> &EventSource<StreamInfo> {
		&self.update
	}

	fn info(&self) -> StreamInfo {
		// Worst case a 5-byte size prefix per write.
		shrink(self.inner.info(), 5)
	}

	fn restream(&mut self) {
		self.inner.restream();
	}
}

const CRYPTO_OVERHEAD: u32 = 12 + 16; // 12-byte nonce + 16-byte AEAD tag

fn build_nonce(salt: [u8; 4], counter: u64) -> Nonce {
	let mut bytes = [0u8; 12];
	bytes[..4].copy_from_slice(&salt);
	bytes[4..].copy_from_slice(&counter.to_le_bytes());
	*Nonce::from_slice(&bytes)
}

/// Bidirectional AEAD gate (`spec.md` §4.2 "`CryptoGate`", §6 "Symmetric
/// AEAD: ChaCha20-Poly1305"). Each outbound write carries its own 12-byte
/// nonce (4-byte session salt + 8-byte little-endian counter) so the
/// receiver never needs out-of-band nonce state. `restream()` rotates the
/// salt, the required invariant from `spec.md` §9: reusing a (salt, counter)
/// pair across a reconnect would be nonce reuse against the same key.
pub struct CryptoGate {
	inner: Box<dyn ByteStream>,
	cipher: ChaCha20Poly1305,
	salt: [u8; 4],
	send_counter: u64,
	errored: Arc<std::sync::atomic::AtomicBool>,
	out_data: Arc<EventSource<Bytes>>,
	update: Arc<EventSource<StreamInfo>>,
	_data_sub: Subscription,
	_update_sub: Subscription,
}

impl CryptoGate {
	pub fn new(mut inner: Box<dyn ByteStream>, provider: &dyn KeyProvider) -> Self {
		let cipher = ChaCha20Poly1305::new_from_slice(&provider.symmetric_key()).expect("32-byte key");
		let out_data = Arc::new(EventSource::new());
		let update = Arc::new(EventSource::new());
		let errored = Arc::new(std::sync::atomic::AtomicBool::new(false));

		let forward = out_data.clone();
		let cipher_recv = cipher.clone();
		let errored_recv = errored.clone();
		let data_sub = inner.out_data_event().subscribe(move |data: &Bytes| match decrypt(&cipher_recv, data) {
			Ok(plain) => forward.emit(&plain),
			Err(err) => {
				tracing::warn!(%err, "CryptoGate: AEAD decrypt failed, flagging link error");
				errored_recv.store(true, std::sync::atomic::Ordering::SeqCst);
			}
		});

		let update_forward = update.clone();
		let update_sub = inner.stream_update_event().subscribe(move |info: &StreamInfo| {
			update_forward.emit(&shrink(*info, CRYPTO_OVERHEAD));
		});

		Self {
			inner,
			cipher,
			salt: rand::random(),
			send_counter: 0,
			errored,
			out_data,
			update,
			_data_sub: data_sub,
			_update_sub: update_sub,
		}
	}
}

fn decrypt(cipher: &ChaCha20Poly1305, data: &Bytes) -> StreamResult<Bytes> {
	if data.len() < CRYPTO_OVERHEAD as usize {
		return ProtocolViolationSnafu {
			reason: format!("ciphertext of {} bytes shorter than nonce+tag overhead", data.len()),
		}
		.fail();
	}
	let nonce = Nonce::from_slice(&data[..12]).to_owned();
	let mut buf = data[12..].to_vec();
	cipher
		.decrypt_in_place(&nonce, b"", &mut buf)
		.map_err(|_| CryptoSnafu { reason: "AEAD tag verification failed".to_string() }.build())?;
	Ok(Bytes::from(buf))
}

impl ByteStream for CryptoGate {
	fn write(&mut self, data: Bytes) -> CoreResult<()> {
		let nonce = build_nonce(self.salt, self.send_counter);
		self.send_counter += 1;
		let mut buf = data.to_vec();
		self.cipher
			.encrypt_in_place(&nonce, b"", &mut buf)
			.map_err(|_| CoreProtocolViolationSnafu { reason: "AEAD encryption failed".to_string() }.build())?;
		let mut framed = BytesMut::with_capacity(12 + buf.len());
		framed.extend_from_slice(nonce.as_slice());
		framed.extend_from_slice(&buf);
		self.inner.write(framed.freeze())
	}

	fn out_data_event(&self) -> &EventSource<Bytes> {
		&self.out_data
	}

	fn stream_update_event(&self) -> &EventSource<StreamInfo> {
		&self.update
	}

	fn info(&self) -> StreamInfo {
		let mut info = shrink(self.inner.info(), CRYPTO_OVERHEAD);
		if self.errored.load(std::sync::atomic::Ordering::SeqCst) {
			info.link_state = LinkState::LinkError;
			info.is_writable = false;
		}
		info
	}

	fn restream(&mut self) {
		self.salt = rand::random();
		self.send_counter = 0;
		self.errored.store(false, std::sync::atomic::Ordering::SeqCst);
		self.inner.restream();
	}
}

/// Smooths outbound backpressure: writes queue locally (bounded) and drain
/// into the wrapped stream as it accepts them, flipping `is_writable` off
/// once the queue is full rather than refusing immediately (`spec.md` §5
/// "Outbound stream backpressure surfaces as `stream_info.is_writable =
/// false`").
pub struct BufferStream {
	inner: Box<dyn ByteStream>,
	queue: std::collections::VecDeque<Bytes>,
	capacity: usize,
	update: Arc<EventSource<StreamInfo>>,
	writable: bool,
	_update_sub: Subscription,
}

impl BufferStream {
	pub fn new(mut inner: Box<dyn ByteStream>, capacity: usize) -> Self {
		let update = Arc::new(EventSource::new());
		let update_forward = update.clone();
		let update_sub = inner.stream_update_event().subscribe(move |info: &StreamInfo| {
			update_forward.emit(info);
		});
		Self {
			inner,
			queue: std::collections::VecDeque::with_capacity(capacity.min(64)),
			capacity: capacity.max(1),
			update,
			writable: true,
			_update_sub: update_sub,
		}
	}

	fn drain(&mut self) {
		while let Some(front) = self.queue.front().cloned() {
			if self.inner.write(front).is_err() {
				break;
			}
			self.queue.pop_front();
		}
		let writable = self.queue.len() < self.capacity;
		if writable != self.writable {
			self.writable = writable;
			let info = self.info();
			self.update.emit(&info);
		}
	}
}

impl ByteStream for BufferStream {
	fn write(&mut self, data: Bytes) -> CoreResult<()> {
		if self.queue.len() >= self.capacity {
			return BackpressureSnafu {
				buffered: self.queue.len(),
				capacity: self.capacity,
			}
			.fail();
		}
		self.queue.push_back(data);
		self.drain();
		Ok(())
	}

	fn out_data_event(&self) -> &EventSource<Bytes> {
		self.inner.out_data_event()
	}

	fn stream_update_event(&self) -> &EventSource<StreamInfo> {
		&self.update
	}

	fn info(&self) -> StreamInfo {
		let mut info = self.inner.info();
		info.is_writable = info.is_writable && self.writable;
		info
	}

	fn restream(&mut self) {
		self.queue.clear();
		self.writable = true;
		self.inner.restream();
	}
}

/// Typed boundary between a byte-stream chain and application values
/// (`spec.md` §4.2 "`SerializeGate<In, Out>`"). Not itself a [`ByteStream`]:
/// it needs a typed write method and a typed decode event, which the
/// byte-oriented trait can't express. Relies on whatever sits underneath
/// (typically a [`SizedPacketGate`]) to deliver exactly one encoded value per
/// `out_data_event`.
pub struct SerializeGate<In, Out> {
	inner: Box<dyn ByteStream>,
	decoded: Arc<EventSource<In>>,
	_data_sub: Subscription,
	_marker: std::marker::PhantomData<fn(&Out)>,
}

impl<In, Out> SerializeGate<In, Out>
where
	In: WireDecode + Send + 'static,
	Out: WireEncode,
{
	pub fn new(mut inner: Box<dyn ByteStream>) -> Self {
		let decoded = Arc::new(EventSource::new());
		let forward = decoded.clone();
		let data_sub = inner.out_data_event().subscribe(move |data: &Bytes| {
			let mut cursor = data.clone();
			match In::decode(&mut cursor) {
				Ok(Some(value)) => forward.emit(&value),
				Ok(None) => tracing::warn!("SerializeGate: incomplete value in a framed chunk"),
				Err(err) => tracing::warn!(%err, "SerializeGate: malformed value"),
			}
		});
		Self {
			inner,
			decoded,
			_data_sub: data_sub,
			_marker: std::marker::PhantomData,
		}
	}

	pub fn write_value(&mut self, value: &Out) -> CoreResult<()> {
		let mut buf = BytesMut::new();
		value.encode(&mut buf);
		self.inner.write(buf.freeze())
	}

	pub fn decoded_event(&self) -> &EventSource<In> {
		&self.decoded
	}

	pub fn info(&self) -> StreamInfo {
		self.inner.info()
	}

	pub fn stream_update_event(&self) -> &EventSource<StreamInfo> {
		self.inner.stream_update_event()
	}

	pub fn restream(&mut self) {
		self.inner.restream();
	}
}

#[cfg(test)]
mod test {
	use aether_core::stream::LoopbackStream;

	use super::*;

	#[test]
	fn add_header_gate_strips_header_on_read() {
		let (a, b) = LoopbackStream::pair();
		let mut a = AddHeaderGate::new(Box::new(a), Bytes::from_static(b"AE"));
		let received = Arc::new(std::sync::Mutex::new(Vec::new()));
		let r = received.clone();
		let _sub = b.out_data_event().subscribe(move |data: &Bytes| r.lock().unwrap().push(data.clone()));

		a.write(Bytes::from_static(b"hello")).unwrap();
		assert_eq!(received.lock().unwrap().as_slice(), [Bytes::from_static(b"AEhello")]);
	}

	#[test]
	fn add_header_gate_flags_link_error_on_short_frame() {
		let (a, b) = LoopbackStream::pair();
		let b = AddHeaderGate::new(Box::new(b), Bytes::from_static(b"AE"));

		let mut a = a;
		a.write(Bytes::from_static(b"x")).unwrap(); // shorter than the 2-byte header
		assert_eq!(b.info().link_state, LinkState::LinkError);
	}

	#[test]
	fn sized_packet_gate_reassembles_split_chunks() {
		let (a, b) = LoopbackStream::pair();
		let b = SizedPacketGate::new(Box::new(b));
		let received = Arc::new(std::sync::Mutex::new(Vec::new()));
		let r = received.clone();
		let _sub = b.out_data_event().subscribe(move |data: &Bytes| r.lock().unwrap().push(data.clone()));

		let mut framed = BytesMut::new();
		encode_tiered(5, &mut framed).unwrap();
		framed.extend_from_slice(b"hello");
		let whole = framed.freeze();

		let mut a = a;
		// Deliver byte-by-byte to exercise reassembly.
		for byte in whole.iter() {
			a.write(Bytes::copy_from_slice(&[*byte])).unwrap();
		}
		assert_eq!(received.lock().unwrap().as_slice(), [Bytes::from_static(b"hello")]);
	}

	#[test]
	fn sized_packet_gate_emits_two_frames_from_one_chunk() {
		let (a, b) = LoopbackStream::pair();
		let b = SizedPacketGate::new(Box::new(b));
		let received = Arc::new(std::sync::Mutex::new(Vec::new()));
		let r = received.clone();
		let _sub = b.out_data_event().subscribe(move |data: &Bytes| r.lock().unwrap().push(data.clone()));

		let mut frame1 = BytesMut::new();
		encode_tiered(1, &mut frame1).unwrap();
		frame1.extend_from_slice(b"x");
		let mut frame2 = BytesMut::new();
		encode_tiered(400, &mut frame2).unwrap();
		frame2.extend_from_slice(&vec![b'y'; 400]);
		frame1.unsplit(frame2);

		let mut a = a;
		a.write(frame1.freeze()).unwrap();
		let got = received.lock().unwrap();
		assert_eq!(got.len(), 2);
		assert_eq!(got[0], Bytes::from_static(b"x"));
		assert_eq!(got[1].len(), 400);
	}

	#[test]
	fn crypto_gate_round_trips_and_rotates_nonce_on_restream() {
		let (a, b) = LoopbackStream::pair();
		let key = StaticKeyProvider([7u8; 32]);
		let mut a = CryptoGate::new(Box::new(a), &key);
		let b = CryptoGate::new(Box::new(b), &key);
		let received = Arc::new(std::sync::Mutex::new(Vec::new()));
		let r = received.clone();
		let _sub = b.out_data_event().subscribe(move |data: &Bytes| r.lock().unwrap().push(data.clone()));

		a.write(Bytes::from_static(b"secret")).unwrap();
		assert_eq!(received.lock().unwrap().as_slice(), [Bytes::from_static(b"secret")]);

		assert_eq!(a.send_counter, 1);
		let salt_before = a.salt;
		a.restream();
		assert_eq!(a.send_counter, 0);
		assert_ne!(a.salt, salt_before);
	}

	#[test]
	fn crypto_gate_flags_link_error_on_tamper() {
		let (a, b) = LoopbackStream::pair();
		let key_a = StaticKeyProvider([1u8; 32]);
		let key_b = StaticKeyProvider([2u8; 32]); // mismatched key
		let mut a = CryptoGate::new(Box::new(a), &key_a);
		let b = CryptoGate::new(Box::new(b), &key_b);

		a.write(Bytes::from_static(b"hi")).unwrap();
		assert_eq!(b.info().link_state, LinkState::LinkError);
	}

	struct AlwaysFailStream {
		out_data: EventSource<Bytes>,
		update: EventSource<StreamInfo>,
	}

	impl ByteStream for AlwaysFailStream {
		fn write(&mut self, _data: Bytes) -> CoreResult<()> {
			CoreProtocolViolationSnafu { reason: "stuck".to_string() }.fail()
		}

		fn out_data_event(&self) -> &EventSource<Bytes> {
			&self.out_data
		}

		fn stream_update_event(&self) -> &EventSource<StreamInfo> {
			&self.update
		}

		fn info(&self) -> StreamInfo {
			StreamInfo::unlinked()
		}
	}

	#[test]
	fn buffer_stream_refuses_writes_past_capacity() {
		let stuck = AlwaysFailStream {
			out_data: EventSource::new(),
			update: EventSource::new(),
		};
		let mut buffered = BufferStream::new(Box::new(stuck), 1);
		buffered.write(Bytes::from_static(b"one")).unwrap();
		assert!(buffered.write(Bytes::from_static(b"two")).is_err());
	}

	#[test]
	fn serialize_gate_round_trips_a_value() {
		let (a, b) = LoopbackStream::pair();
		let mut a: SerializeGate<u32, u32> = SerializeGate::new(Box::new(SizedPacketGate::new(Box::new(a))));
		let b = SizedPacketGate::new(Box::new(b));
		let b: SerializeGate<u32, u32> = SerializeGate::new(Box::new(b));

		let received = Arc::new(std::sync::Mutex::new(None));
		let r = received.clone();
		let _sub = b.decoded_event().subscribe(move |value: &u32| *r.lock().unwrap() = Some(*value));

		a.write_value(&42u32).unwrap();
		assert_eq!(*received.lock().unwrap(), Some(42u32));
	}
}
