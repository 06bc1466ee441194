//! Correlation-id bookkeeping for `ApiPromisePtr<T>` (`spec.md` §4.6 "Return
//! values"). No `ReturnResultApi`/`ApiPromise` header survived distillation
//! into `original_source/`, so this follows the spec prose directly:
//! "Requests that expect a response allocate a correlation id, subscribe to
//! the `ReturnResultApi` events, and resolve the corresponding promise-action
//! on match." Resolution here is a `tokio::sync::oneshot`, the same
//! I/O-bound-wait pattern `aether-channel`'s `AccessPoint::connect` uses
//! (`futures::future::Shared`) rather than the cooperative C1 scheduler —
//! waiting on a network round trip isn't a CPU-bound tick, so there's no
//! `Action` to drive.

use std::{
	backtrace::Backtrace,
	collections::HashMap,
	sync::{Arc, Mutex},
};

use aether_core::wire::{WireDecode, WireEncode};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::{
	error::{ApiError, ApiResult, ProtocolViolationSnafu, RemoteErrorSnafu},
	method::write_method_id,
};

/// Reserved method ids for the `ReturnResultApi` extension embedded at the
/// end of every dispatch table with at least one `ApiPromisePtr<T>` method
/// (`spec.md` §4.6). The original registers these via `ExtApi` at whatever
/// id follows the API's own methods; fixing them at 0/1 here is a documented
/// simplification (see `DESIGN.md`) since every API in this crate reserves
/// them up front rather than appending them last.
pub const METHOD_SEND_RESULT: u8 = 0;
pub const METHOD_SEND_ERROR: u8 = 1;

type PendingResult = oneshot::Sender<Result<Bytes, String>>;

/// Allocates correlation ids and routes `send_result`/`send_error` back to
/// the waiting [`ApiPromise`].
#[derive(Default)]
pub struct ProtocolContext {
	next_id: Mutex<u32>,
	pending: Mutex<HashMap<u32, PendingResult>>,
}

impl ProtocolContext {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Reserves a correlation id and returns the promise that will resolve
	/// once a matching `send_result`/`send_error` call arrives.
	pub fn new_promise<T: WireDecode>(self: &Arc<Self>) -> (u32, ApiPromise<T>) {
		let mut next_id = self.next_id.lock().unwrap();
		let id = *next_id;
		*next_id = next_id.wrapping_add(1);
		drop(next_id);

		let (tx, rx) = oneshot::channel();
		self.pending.lock().unwrap().insert(id, tx);
		(
			id,
			ApiPromise {
				correlation_id: id,
				rx,
				_marker: std::marker::PhantomData,
			},
		)
	}

	/// `ReturnResultApi::send_result` handler: resolves the pending promise
	/// with the still-encoded return value.
	pub fn handle_send_result(&self, correlation_id: u32, value: Bytes) {
		if let Some(tx) = self.pending.lock().unwrap().remove(&correlation_id) {
			let _ = tx.send(Ok(value));
		} else {
			tracing::debug!(correlation_id, "send_result for unknown or already-resolved correlation id");
		}
	}

	/// `ReturnResultApi::send_error` handler.
	pub fn handle_send_error(&self, correlation_id: u32, message: String) {
		if let Some(tx) = self.pending.lock().unwrap().remove(&correlation_id) {
			let _ = tx.send(Err(message));
		} else {
			tracing::debug!(correlation_id, "send_error for unknown or already-resolved correlation id");
		}
	}

	/// Abandons a promise the caller no longer intends to await, e.g. after
	/// the owning stream tore down.
	pub fn cancel(&self, correlation_id: u32) {
		self.pending.lock().unwrap().remove(&correlation_id);
	}
}

/// A pending `ApiPromisePtr<T>` (`spec.md` §4.6).
pub struct ApiPromise<T> {
	correlation_id: u32,
	rx: oneshot::Receiver<Result<Bytes, String>>,
	_marker: std::marker::PhantomData<T>,
}

impl<T: WireDecode> ApiPromise<T> {
	pub fn correlation_id(&self) -> u32 {
		self.correlation_id
	}

	/// Awaits the matching `send_result`/`send_error` call and decodes the
	/// result, or fails if the `ProtocolContext` dropped the sender first
	/// (the owning stream tore down before a response arrived).
	pub async fn resolve(self) -> ApiResult<T> {
		let correlation_id = self.correlation_id;
		let outcome = self.rx.await.map_err(|_| ApiError::PromiseDropped {
			correlation_id,
			backtrace: Backtrace::capture(),
		})?;
		match outcome {
			Ok(mut bytes) => match T::decode(&mut bytes)? {
				Some(value) => Ok(value),
				None => ProtocolViolationSnafu {
					api_name: "ReturnResultApi",
					method_name: "send_result",
					reason: "value did not decode fully",
				}
				.fail(),
			},
			Err(message) => RemoteErrorSnafu { correlation_id, message }.fail(),
		}
	}
}

/// Encodes a `send_result(correlation_id, value)` call.
pub fn encode_send_result(correlation_id: u32, value: &impl WireEncode, dst: &mut BytesMut) {
	write_method_id(METHOD_SEND_RESULT, dst);
	dst.put_u32_le(correlation_id);
	value.encode(dst);
}

/// Encodes a `send_error(correlation_id, message)` call.
pub fn encode_send_error(correlation_id: u32, message: &str, dst: &mut BytesMut) {
	write_method_id(METHOD_SEND_ERROR, dst);
	dst.put_u32_le(correlation_id);
	let _ = aether_core::wire::encode_str(message, dst);
}

#[cfg(test)]
mod test {
	use bytes::Buf;

	use super::*;

	#[tokio::test]
	async fn promise_resolves_on_matching_send_result() {
		let ctx = ProtocolContext::new();
		let (correlation_id, promise) = ctx.new_promise::<u32>();

		let mut value = BytesMut::new();
		42u32.encode(&mut value);
		ctx.handle_send_result(correlation_id, value.freeze());

		assert_eq!(promise.resolve().await.unwrap(), 42);
	}

	#[tokio::test]
	async fn promise_fails_on_send_error() {
		let ctx = ProtocolContext::new();
		let (correlation_id, promise) = ctx.new_promise::<u32>();
		ctx.handle_send_error(correlation_id, "access denied".to_string());

		let err = promise.resolve().await.unwrap_err();
		assert!(matches!(err, ApiError::RemoteError { .. }));
	}

	#[tokio::test]
	async fn dropped_context_fails_the_promise() {
		let ctx = ProtocolContext::new();
		let (correlation_id, promise) = ctx.new_promise::<u32>();
		ctx.cancel(correlation_id);

		let err = promise.resolve().await.unwrap_err();
		assert!(matches!(err, ApiError::PromiseDropped { .. }));
	}

	#[test]
	fn send_result_wire_shape_is_id_then_correlation_then_value() {
		let mut buf = BytesMut::new();
		encode_send_result(7, &99u32, &mut buf);
		assert_eq!(buf[0], METHOD_SEND_RESULT);
		let mut rest = buf.freeze();
		rest.advance(1);
		assert_eq!(rest.get_u32_le(), 7);
		assert_eq!(rest.get_u32_le(), 99);
	}
}
