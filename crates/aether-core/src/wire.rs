//! Tiered-int length prefixing (`spec.md` §6) and the bitmask/tagged-union
//! record helpers used by `NullableType`/`VariantType`-shaped records
//! (`spec.md` §3 invariants, §8 properties 4 and 7).
//!
//! Every size field on the wire — collection lengths, string lengths, framed
//! packet sizes — goes through [`encode_tiered`]/[`decode_tiered`]:
//!
//! - `v < 250`            → 1 byte: `v`
//! - `250 <= v < 65536`    → 3 bytes: `250, lo, hi` (u16 little-endian)
//! - `v >= 65536`          → 5 bytes: `251, b0, b1, b2, b3` (u32 little-endian)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BufferUnderrunSnafu, CoreResult, TieredIntOverflowSnafu};

const SMALL_MAX: u64 = 250;
const MEDIUM_MARKER: u8 = 250;
const LARGE_MARKER: u8 = 251;
const MEDIUM_MAX: u64 = u16::MAX as u64;
const LARGE_MAX: u64 = u32::MAX as u64;

/// Number of bytes [`encode_tiered`] will write for `value`, without writing
/// anything — gates use this to budget `Overhead()` (`spec.md` §4.2).
pub fn tiered_len(value: u64) -> usize {
	if value < SMALL_MAX {
		1
	} else if value <= MEDIUM_MAX {
		3
	} else {
		5
	}
}

pub fn encode_tiered(value: u64, dst: &mut BytesMut) -> CoreResult<()> {
	if value < SMALL_MAX {
		dst.reserve(1);
		dst.put_u8(value as u8);
	} else if value <= MEDIUM_MAX {
		dst.reserve(3);
		dst.put_u8(MEDIUM_MARKER);
		dst.put_u16_le(value as u16);
	} else if value <= LARGE_MAX {
		dst.reserve(5);
		dst.put_u8(LARGE_MARKER);
		dst.put_u32_le(value as u32);
	} else {
		return TieredIntOverflowSnafu { value }.fail();
	}
	Ok(())
}

/// Returns `Ok(None)` if `src` does not yet contain a complete tiered-int,
/// without consuming anything — the same "ask again once more bytes arrive"
/// contract `tokio_util::codec::Decoder::decode` uses.
pub fn decode_tiered(src: &mut Bytes) -> CoreResult<Option<u64>> {
	if src.is_empty() {
		return Ok(None);
	}
	let marker = src[0];
	match marker {
		0..=249 => {
			src.advance(1);
			Ok(Some(marker as u64))
		}
		MEDIUM_MARKER => {
			if src.len() < 3 {
				return Ok(None);
			}
			src.advance(1);
			Ok(Some(src.get_u16_le() as u64))
		}
		LARGE_MARKER => {
			if src.len() < 5 {
				return Ok(None);
			}
			src.advance(1);
			Ok(Some(src.get_u32_le() as u64))
		}
		_ => unreachable!("marker is a u8 and all 256 values are covered above"),
	}
}

/// Encodes a tiered-int-prefixed UTF-8 string.
pub fn encode_str(value: &str, dst: &mut BytesMut) -> CoreResult<()> {
	encode_tiered(value.len() as u64, dst)?;
	dst.put_slice(value.as_bytes());
	Ok(())
}

pub fn decode_str(src: &mut Bytes, what: &'static str) -> CoreResult<Option<String>> {
	let start = src.clone();
	let Some(len) = decode_tiered(src)? else {
		return Ok(None);
	};
	let len = len as usize;
	if src.len() < len {
		*src = start;
		return Ok(None);
	}
	let raw = src.split_to(len);
	let s = std::str::from_utf8(&raw)
		.map_err(|source| crate::error::CoreError::InvalidUtf8 {
			what,
			source,
			backtrace: std::backtrace::Backtrace::capture(),
		})?
		.to_string();
	Ok(Some(s))
}

/// Encodes a tiered-int-prefixed byte blob (used for sub-API embedding,
/// `spec.md` §4.6).
pub fn encode_bytes(value: &[u8], dst: &mut BytesMut) -> CoreResult<()> {
	encode_tiered(value.len() as u64, dst)?;
	dst.put_slice(value);
	Ok(())
}

pub fn decode_bytes(src: &mut Bytes) -> CoreResult<Option<Bytes>> {
	let start = src.clone();
	let Some(len) = decode_tiered(src)? else {
		return Ok(None);
	};
	let len = len as usize;
	if src.len() < len {
		*src = start;
		return Ok(None);
	}
	Ok(Some(src.split_to(len)))
}

/// Aggregates `presence` flags for a `NullableType`-shaped record into a
/// single bitmask byte (or bytes, for >8 optional fields) preceding the
/// values of the fields that are actually present, per `spec.md` §3 and the
/// round-trip law in §8.
pub struct NullableMask {
	bits: Vec<bool>,
}

impl NullableMask {
	pub fn new(len: usize) -> Self {
		Self { bits: vec![false; len] }
	}

	pub fn set(&mut self, index: usize, present: bool) {
		self.bits[index] = present;
	}

	pub fn is_set(&self, index: usize) -> bool {
		self.bits[index]
	}

	pub fn byte_len(&self) -> usize {
		self.bits.len().div_ceil(8)
	}

	pub fn encode(&self, dst: &mut BytesMut) {
		for chunk in self.bits.chunks(8) {
			let mut byte = 0u8;
			for (i, &bit) in chunk.iter().enumerate() {
				if bit {
					byte |= 1 << i;
				}
			}
			dst.put_u8(byte);
		}
	}

	pub fn decode(src: &mut Bytes, field_count: usize) -> CoreResult<Option<Self>> {
		let needed = field_count.div_ceil(8);
		if src.len() < needed {
			return Ok(None);
		}
		let mut bits = vec![false; field_count];
		for i in 0..field_count {
			let byte = src[i / 8];
			bits[i] = (byte >> (i % 8)) & 1 == 1;
		}
		src.advance(needed);
		Ok(Some(Self { bits }))
	}
}

/// Encodes a typed value onto the wire (`spec.md` §6: "argument payloads
/// serialized field-by-field in declaration order"). Implemented once per
/// record/primitive type instead of through the original's visitor-based
/// reflection (`spec.md` §9's guidance: "a derive-once-per-type mechanism").
pub trait WireEncode {
	fn encode(&self, dst: &mut BytesMut);
}

/// Decodes a typed value off the front of `src`, returning `Ok(None)` if
/// `src` does not yet hold a complete value (the same "ask again" contract
/// every decoder in this crate follows).
pub trait WireDecode: Sized {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>>;
}

macro_rules! impl_wire_int {
	($ty:ty, $put:ident, $get:ident) => {
		impl WireEncode for $ty {
			fn encode(&self, dst: &mut BytesMut) {
				dst.$put(*self);
			}
		}
		impl WireDecode for $ty {
			fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
				if src.len() < std::mem::size_of::<$ty>() {
					return Ok(None);
				}
				Ok(Some(src.$get()))
			}
		}
	};
}

impl_wire_int!(u16, put_u16_le, get_u16_le);
impl_wire_int!(u32, put_u32_le, get_u32_le);
impl_wire_int!(u64, put_u64_le, get_u64_le);
impl_wire_int!(i32, put_i32_le, get_i32_le);
impl_wire_int!(i64, put_i64_le, get_i64_le);

impl WireEncode for u8 {
	fn encode(&self, dst: &mut BytesMut) {
		dst.put_u8(*self);
	}
}
impl WireDecode for u8 {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		if src.is_empty() {
			return Ok(None);
		}
		Ok(Some(src.get_u8()))
	}
}

impl WireEncode for bool {
	fn encode(&self, dst: &mut BytesMut) {
		dst.put_u8(if *self { 1 } else { 0 });
	}
}
impl WireDecode for bool {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		if src.is_empty() {
			return Ok(None);
		}
		Ok(Some(src.get_u8() != 0))
	}
}

impl WireEncode for String {
	fn encode(&self, dst: &mut BytesMut) {
		// `encode_str` only fails on a length overflow no `String` can reach.
		let _ = encode_str(self, dst);
	}
}
impl WireDecode for String {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		decode_str(src, "string field")
	}
}

impl WireEncode for Bytes {
	fn encode(&self, dst: &mut BytesMut) {
		let _ = encode_bytes(self, dst);
	}
}
impl WireDecode for Bytes {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		decode_bytes(src)
	}
}

/// `spec.md` §6: "arrays use tiered-int length prefix". Every element must
/// decode fully or the whole array reports `Ok(None)` (more bytes needed).
impl<T: WireEncode> WireEncode for Vec<T> {
	fn encode(&self, dst: &mut BytesMut) {
		let _ = encode_tiered(self.len() as u64, dst);
		for item in self {
			item.encode(dst);
		}
	}
}
impl<T: WireDecode> WireDecode for Vec<T> {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		let start = src.clone();
		let Some(len) = decode_tiered(src)? else {
			return Ok(None);
		};
		let mut items = Vec::with_capacity((len as usize).min(1 << 16));
		for _ in 0..len {
			match T::decode(src)? {
				Some(item) => items.push(item),
				None => {
					*src = start;
					return Ok(None);
				}
			}
		}
		Ok(Some(items))
	}
}

/// `spec.md` §6: "optionals are a 1-byte presence flag plus the value if
/// present".
impl<T: WireEncode> WireEncode for Option<T> {
	fn encode(&self, dst: &mut BytesMut) {
		match self {
			Some(value) => {
				dst.put_u8(1);
				value.encode(dst);
			}
			None => dst.put_u8(0),
		}
	}
}
impl<T: WireDecode> WireDecode for Option<T> {
	fn decode(src: &mut Bytes) -> CoreResult<Option<Self>> {
		if src.is_empty() {
			return Ok(None);
		}
		let start = src.clone();
		let present = src.get_u8();
		if present == 0 {
			return Ok(Some(None));
		}
		match T::decode(src)? {
			Some(value) => Ok(Some(Some(value))),
			None => {
				*src = start;
				Ok(None)
			}
		}
	}
}

#[cfg(test)]
mod test {
	use bytes::BytesMut;

	use super::*;

	#[test]
	fn tiered_int_round_trip_small() {
		for v in [0u64, 1, 42, 249] {
			let mut buf = BytesMut::new();
			encode_tiered(v, &mut buf).unwrap();
			assert_eq!(buf.len(), 1);
			assert_eq!(tiered_len(v), 1);
			let mut b = buf.freeze();
			assert_eq!(decode_tiered(&mut b).unwrap(), Some(v));
		}
	}

	#[test]
	fn tiered_int_round_trip_medium() {
		for v in [250u64, 300, 65535] {
			let mut buf = BytesMut::new();
			encode_tiered(v, &mut buf).unwrap();
			assert_eq!(buf.len(), 3);
			assert_eq!(tiered_len(v), 3);
			let mut b = buf.freeze();
			assert_eq!(decode_tiered(&mut b).unwrap(), Some(v));
		}
	}

	#[test]
	fn tiered_int_round_trip_large() {
		for v in [65536u64, 1_000_000, u32::MAX as u64] {
			let mut buf = BytesMut::new();
			encode_tiered(v, &mut buf).unwrap();
			assert_eq!(buf.len(), 5);
			assert_eq!(tiered_len(v), 5);
			let mut b = buf.freeze();
			assert_eq!(decode_tiered(&mut b).unwrap(), Some(v));
		}
	}

	#[test]
	fn tiered_int_overflow_rejected() {
		let mut buf = BytesMut::new();
		assert!(encode_tiered(u32::MAX as u64 + 1, &mut buf).is_err());
	}

	#[test]
	fn tiered_int_partial_data_yields_none() {
		let mut buf = BytesMut::new();
		encode_tiered(70_000, &mut buf).unwrap();
		let mut partial = buf.freeze().split_to(2);
		assert_eq!(decode_tiered(&mut partial).unwrap(), None);
	}

	#[test]
	fn str_round_trip() {
		let mut buf = BytesMut::new();
		encode_str("hello aether", &mut buf).unwrap();
		let mut b = buf.freeze();
		assert_eq!(decode_str(&mut b, "test").unwrap().unwrap(), "hello aether");
	}

	#[test]
	fn nullable_mask_round_trip() {
		let mut mask = NullableMask::new(10);
		mask.set(0, true);
		mask.set(3, true);
		mask.set(9, true);
		let mut buf = BytesMut::new();
		mask.encode(&mut buf);
		assert_eq!(buf.len(), 2);
		let mut b = buf.freeze();
		let decoded = NullableMask::decode(&mut b, 10).unwrap().unwrap();
		assert!(decoded.is_set(0));
		assert!(!decoded.is_set(1));
		assert!(decoded.is_set(3));
		assert!(decoded.is_set(9));
	}
}
