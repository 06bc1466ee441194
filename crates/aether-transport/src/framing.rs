//! Shared tiered-int frame (re)assembly used by transports whose underlying
//! link hands data back in arbitrary-sized chunks rather than through a
//! socket `read()` call — modem and LoRa packet pipes (`spec.md` §4.3 "On
//! TCP mode re-frames via `SizedPacketGate`"). TCP itself reads framed data
//! straight off the socket (see `tcp::read_frame`); this collector exists
//! for drivers that deliver bytes via an event callback instead.

use aether_core::wire::decode_tiered;
use bytes::{Buf, Bytes, BytesMut};

/// Accumulates pushed byte chunks and yields every complete length-prefixed
/// frame they contain, buffering a partial trailing frame for the next
/// push. A malformed length prefix resets the buffer rather than wedging
/// the stream forever — the wire layer treats this as a dropped,
/// re-synchronizable stream, not a fatal protocol violation, since a single
/// corrupted modem packet must not block all future frames.
#[derive(Default)]
pub struct FrameCollector {
	buf: BytesMut,
}

impl FrameCollector {
	pub fn new() -> Self {
		Self { buf: BytesMut::new() }
	}

	pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
		self.buf.extend_from_slice(chunk);
		let mut frames = Vec::new();
		loop {
			let mut view: Bytes = self.buf.clone().freeze();
			let before = view.len();
			match decode_tiered(&mut view) {
				Ok(Some(len)) => {
					let header_len = before - view.len();
					let len = len as usize;
					if view.len() < len {
						break; // wait for more data
					}
					let frame = view.split_to(len);
					self.buf.advance(header_len + len);
					frames.push(frame);
				}
				Ok(None) => break,
				Err(_) => {
					self.buf.clear();
					break;
				}
			}
		}
		frames
	}
}

/// Splits `data` into chunks no larger than `max_len`, used to fit a framed
/// write into a modem/LoRa driver's packet size ceiling (`spec.md` §4.3:
/// "Chunks outbound data into ≤1024-byte packets for TCP mode").
pub fn split_chunks(data: &[u8], max_len: usize) -> Vec<Bytes> {
	if data.is_empty() {
		return vec![Bytes::new()];
	}
	data.chunks(max_len).map(Bytes::copy_from_slice).collect()
}

#[cfg(test)]
mod test {
	use aether_core::wire::encode_tiered;

	use super::*;

	#[test]
	fn reassembles_frame_split_across_pushes() {
		let mut framed = BytesMut::new();
		encode_tiered(5, &mut framed).unwrap();
		framed.extend_from_slice(b"hello");

		let mut collector = FrameCollector::new();
		let mid = framed.len() / 2;
		assert!(collector.push(&framed[..mid]).is_empty());
		let frames = collector.push(&framed[mid..]);
		assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
	}

	#[test]
	fn two_back_to_back_frames_in_one_push() {
		let mut framed = BytesMut::new();
		encode_tiered(1, &mut framed).unwrap();
		framed.extend_from_slice(b"a");
		encode_tiered(2, &mut framed).unwrap();
		framed.extend_from_slice(b"bc");

		let mut collector = FrameCollector::new();
		let frames = collector.push(&framed);
		assert_eq!(frames, vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")]);
	}

	#[test]
	fn split_chunks_respects_max_len() {
		let data = vec![0u8; 2500];
		let chunks = split_chunks(&data, 1024);
		assert_eq!(chunks.len(), 3);
		assert_eq!(chunks[0].len(), 1024);
		assert_eq!(chunks[2].len(), 452);
	}
}
