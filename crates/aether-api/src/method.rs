//! Method-id dispatch and sub-API embedding (`spec.md` §4.6), grounded on
//! `original_source/aether/api_protocol`'s `Method<id, Signature>` /
//! `ApiParser` split (no `api_protocol.h` survived distillation into this
//! pack; the scaffolding below follows `spec.md` §4.6's prose directly: "a
//! parser ... reads a `u8 method_id`, looks up a dispatch table ... and
//! invokes the handler with deserialized arguments").
//!
//! There is no macro-based reflection here — each concrete API type (see
//! `work_server_api`, `client_api_safe`, `registration_api`) writes its own
//! `dispatch()` as a plain `match` over method ids, since the method set per
//! API is small and fixed at compile time (`spec.md` §9's guidance to
//! replace the original's object system with a derive-once mechanism).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ApiResult;

/// Writes the 1-byte method id a call dispatches on. Callers append their
/// own argument fields afterward via [`aether_core::wire::WireEncode`]
/// (`spec.md` §6: "field-by-field in declaration order").
pub fn write_method_id(method_id: u8, dst: &mut BytesMut) {
	dst.put_u8(method_id);
}

/// Reads the 1-byte method id. Returns `None` if `src` is empty (more bytes
/// needed), the same "ask again" contract every decoder in this workspace
/// follows.
pub fn read_method_id(src: &mut Bytes) -> Option<u8> {
	if src.is_empty() {
		return None;
	}
	Some(src.get_u8())
}

/// Encodes a nested sub-API call as a length-prefixed blob (`spec.md` §4.6
/// "Sub-APIs": "encoded as a length-prefixed byte blob whose contents are
/// recursively the sub-API's own serialized method call"). `write_inner`
/// writes the sub-API's own `[method_id][args...]` call; this function
/// frames it so the outer call can embed it as one argument, e.g.
/// `root.enter(crypto_lib, registration_api.registration(...))`.
pub fn encode_sub_api(dst: &mut BytesMut, write_inner: impl FnOnce(&mut BytesMut)) {
	let mut inner = BytesMut::new();
	write_inner(&mut inner);
	let _ = aether_core::wire::encode_bytes(&inner, dst);
}

/// Decodes a length-prefixed sub-API blob off the front of `src`. The
/// caller feeds the returned bytes to the sub-API's own `dispatch`.
pub fn decode_sub_api(src: &mut Bytes) -> ApiResult<Option<Bytes>> {
	Ok(aether_core::wire::decode_bytes(src)?)
}

/// Implemented by every API class's generated dispatcher (`spec.md` §4.6:
/// "A parser ... looks up a dispatch table built from the API class's
/// method list"). `API_NAME` only feeds [`crate::error::ApiError`] messages
/// and tracing spans.
pub trait ApiDispatch {
	const API_NAME: &'static str;

	/// Dispatches one call. `body` is everything on the wire after the
	/// method id and must be consumed in full on success — a short read
	/// (trailing bytes left in `body`) is a [`crate::error::ApiError::ProtocolViolation`].
	fn dispatch(&self, method_id: u8, body: Bytes) -> ApiResult<()>;
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn method_id_round_trips() {
		let mut buf = BytesMut::new();
		write_method_id(42, &mut buf);
		let mut b = buf.freeze();
		assert_eq!(read_method_id(&mut b), Some(42));
		assert!(b.is_empty());
	}

	#[test]
	fn sub_api_blob_is_length_prefixed_and_recoverable() {
		let mut dst = BytesMut::new();
		write_method_id(4, &mut dst); // outer method id
		encode_sub_api(&mut dst, |inner| {
			write_method_id(3, inner);
			inner.put_u32_le(7);
		});
		let mut src = dst.freeze();
		assert_eq!(read_method_id(&mut src), Some(4));
		let blob = decode_sub_api(&mut src).unwrap().unwrap();
		assert!(src.is_empty());
		let mut inner = blob;
		assert_eq!(read_method_id(&mut inner), Some(3));
		assert_eq!(inner.get_u32_le(), 7);
	}
}
