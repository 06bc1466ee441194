//! Work-server API: the calls a client makes into its cloud once logged in
//! (`spec.md` §4.6, §6), grounded on
//! `original_source/aether/work_cloud_api/work_server_api/{login_api,authorized_api}.h`.
//!
//! These are client-side call builders, not dispatchers — `LoginApi` and
//! `AuthorizedApi` live on the server; this crate only needs to *encode*
//! calls into them and correlate their `ApiPromisePtr<T>` responses. `sink`
//! is whatever pushes the encoded bytes onto the session's outbound stream
//! (typically a `ChannelSelectionStream` or a safe-stream sitting on top of
//! one); this crate stays agnostic to which.

use std::sync::Arc;

use aether_core::{
	error::CoreResult,
	types::{AeMessage, ServerId, Uid},
	wire::{WireDecode, WireEncode},
};
use bytes::{Bytes, BytesMut};

use crate::{
	correlation::{ApiPromise, ProtocolContext},
	method::{encode_sub_api, write_method_id},
	work_cloud::Telemetric,
};

/// A fire-and-forget or call-and-correlate sink for encoded method calls.
pub type CallSink = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Marker return type for `ApiPromisePtr<void>` methods — resolves with no
/// payload, so decoding always succeeds without consuming any bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

impl WireDecode for Ack {
	fn decode(_src: &mut Bytes) -> CoreResult<Option<Self>> {
		Ok(Some(Ack))
	}
}

pub mod login_api {
	pub const GET_TIME_UTC: u8 = 3;
	pub const LOGIN_BY_UID: u8 = 4;
	pub const LOGIN_BY_ALIAS: u8 = 5;
}

pub mod authorized_api {
	pub const PING: u8 = 4;
	pub const SEND_MESSAGE: u8 = 6;
	pub const SEND_MESSAGES: u8 = 7;
	pub const CHECK_ACCESS_FOR_SEND_MESSAGE: u8 = 11;
	pub const RESOLVER_SERVERS: u8 = 12;
	pub const RESOLVER_CLOUDS: u8 = 13;
	pub const SEND_TELEMETRY: u8 = 18;
}

/// Pre-authorization entry point into a work server (`spec.md` §6
/// "Authorized session" setup). `login_by_uid`/`login_by_alias` embed an
/// `AuthorizedApi` sub-call that only takes effect once the server accepts
/// the login.
pub struct LoginApi {
	protocol_context: Arc<ProtocolContext>,
	sink: CallSink,
}

impl LoginApi {
	pub fn new(protocol_context: Arc<ProtocolContext>, sink: CallSink) -> Self {
		Self { protocol_context, sink }
	}

	pub fn get_time_utc(&self) -> ApiPromise<u64> {
		let (correlation_id, promise) = self.protocol_context.new_promise();
		let mut buf = BytesMut::new();
		write_method_id(login_api::GET_TIME_UTC, &mut buf);
		correlation_id.encode(&mut buf);
		(self.sink)(buf.freeze());
		promise
	}

	/// `write_authorized_call` encodes one `AuthorizedApi` method call into
	/// the buffer it's given; it is embedded as the login's sub-API blob
	/// (`spec.md` §4.6 "Sub-APIs").
	pub fn login_by_uid(&self, uid: Uid, write_authorized_call: impl FnOnce(&mut BytesMut)) {
		let mut buf = BytesMut::new();
		write_method_id(login_api::LOGIN_BY_UID, &mut buf);
		uid.encode(&mut buf);
		encode_sub_api(&mut buf, write_authorized_call);
		(self.sink)(buf.freeze());
	}

	pub fn login_by_alias(&self, alias: Uid, write_authorized_call: impl FnOnce(&mut BytesMut)) {
		let mut buf = BytesMut::new();
		write_method_id(login_api::LOGIN_BY_ALIAS, &mut buf);
		alias.encode(&mut buf);
		encode_sub_api(&mut buf, write_authorized_call);
		(self.sink)(buf.freeze());
	}
}

/// The authorized session surface (`spec.md` §4.6, §6). Available once
/// `LoginApi::login_by_uid`/`login_by_alias` is accepted.
pub struct AuthorizedApi {
	protocol_context: Arc<ProtocolContext>,
	sink: CallSink,
}

impl AuthorizedApi {
	pub fn new(protocol_context: Arc<ProtocolContext>, sink: CallSink) -> Self {
		Self { protocol_context, sink }
	}

	/// Keeps the connection alive and tells the server how long the client
	/// plans to wait before its next reconnect attempt (`spec.md` §4.7
	/// keep-alive).
	pub fn ping(&self, next_connect_ms_duration: u64) -> ApiPromise<Ack> {
		let (correlation_id, promise) = self.protocol_context.new_promise();
		let mut buf = BytesMut::new();
		write_method_id(authorized_api::PING, &mut buf);
		correlation_id.encode(&mut buf);
		next_connect_ms_duration.encode(&mut buf);
		(self.sink)(buf.freeze());
		promise
	}

	pub fn send_message(&self, message: AeMessage) {
		let mut buf = BytesMut::new();
		write_method_id(authorized_api::SEND_MESSAGE, &mut buf);
		message.encode(&mut buf);
		(self.sink)(buf.freeze());
	}

	pub fn send_messages(&self, messages: Vec<AeMessage>) {
		let mut buf = BytesMut::new();
		write_method_id(authorized_api::SEND_MESSAGES, &mut buf);
		messages.encode(&mut buf);
		(self.sink)(buf.freeze());
	}

	pub fn check_access_for_send_message(&self, uid: Uid) -> ApiPromise<Ack> {
		let (correlation_id, promise) = self.protocol_context.new_promise();
		let mut buf = BytesMut::new();
		write_method_id(authorized_api::CHECK_ACCESS_FOR_SEND_MESSAGE, &mut buf);
		correlation_id.encode(&mut buf);
		uid.encode(&mut buf);
		(self.sink)(buf.freeze());
		promise
	}

	pub fn resolver_servers(&self, sids: Vec<ServerId>) {
		let mut buf = BytesMut::new();
		write_method_id(authorized_api::RESOLVER_SERVERS, &mut buf);
		sids.encode(&mut buf);
		(self.sink)(buf.freeze());
	}

	pub fn resolver_clouds(&self, uids: Vec<Uid>) {
		let mut buf = BytesMut::new();
		write_method_id(authorized_api::RESOLVER_CLOUDS, &mut buf);
		uids.encode(&mut buf);
		(self.sink)(buf.freeze());
	}

	pub fn send_telemetry(&self, telemetric: Telemetric) {
		let mut buf = BytesMut::new();
		write_method_id(authorized_api::SEND_TELEMETRY, &mut buf);
		telemetric.encode(&mut buf);
		(self.sink)(buf.freeze());
	}
}

#[cfg(test)]
mod test {
	use std::sync::{Arc, Mutex};

	use super::*;

	fn collecting_sink() -> (CallSink, Arc<Mutex<Vec<Bytes>>>) {
		let calls = Arc::new(Mutex::new(Vec::new()));
		let recorder = calls.clone();
		let sink: CallSink = Arc::new(move |bytes| recorder.lock().unwrap().push(bytes));
		(sink, calls)
	}

	#[test]
	fn send_message_encodes_method_id_then_message() {
		let (sink, calls) = collecting_sink();
		let api = AuthorizedApi::new(ProtocolContext::new(), sink);
		let message = AeMessage {
			uid: Uid::from_bytes([1u8; 16]),
			data: Bytes::from_static(b"hi"),
		};
		api.send_message(message.clone());

		let calls = calls.lock().unwrap();
		assert_eq!(calls.len(), 1);
		assert_eq!(calls[0][0], authorized_api::SEND_MESSAGE);
		let mut rest = calls[0].slice(1..);
		assert_eq!(AeMessage::decode(&mut rest).unwrap().unwrap(), message);
	}

	#[tokio::test]
	async fn ping_allocates_a_promise_resolved_by_its_correlation_id() {
		let (sink, calls) = collecting_sink();
		let ctx = ProtocolContext::new();
		let api = AuthorizedApi::new(ctx.clone(), sink);
		let promise = api.ping(5_000);

		let call = calls.lock().unwrap()[0].clone();
		assert_eq!(call[0], authorized_api::PING);
		let correlation_id = promise.correlation_id();
		ctx.handle_send_result(correlation_id, Bytes::new());

		assert_eq!(promise.resolve().await.unwrap(), Ack);
	}

	#[test]
	fn login_by_uid_embeds_authorized_call_as_sub_api_blob() {
		let (sink, calls) = collecting_sink();
		let api = LoginApi::new(ProtocolContext::new(), sink);
		api.login_by_uid(Uid::from_bytes([2u8; 16]), |buf| {
			write_method_id(authorized_api::SEND_MESSAGE, buf);
		});

		let calls = calls.lock().unwrap();
		assert_eq!(calls[0][0], login_api::LOGIN_BY_UID);
		let mut rest = calls[0].slice(1..);
		assert!(Uid::decode(&mut rest).is_some());
		let blob = crate::method::decode_sub_api(&mut rest).unwrap().unwrap();
		assert_eq!(blob[0], authorized_api::SEND_MESSAGE);
	}
}
