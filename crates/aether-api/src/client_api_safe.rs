//! `ClientApiSafe`: the inbound API a work server calls into a connected
//! client (`spec.md` §4.6, §6), grounded on
//! `original_source/aether/work_cloud_api/client_api/client_api_safe.h`.
//!
//! Unlike `work_server_api`, this side *dispatches* — the server is the
//! caller, the client is the handler. Each call fans out through an
//! [`EventSource`] the same way `aether-core::stream::ByteStream` surfaces
//! inbound data, so callers subscribe instead of polling.

use aether_core::{
	event::EventSource,
	types::{AeMessage, Uid},
	wire::{WireDecode, WireEncode},
};
use bytes::Bytes;

use crate::{
	error::{ApiError, ApiResult},
	method::ApiDispatch,
	work_cloud::{CloudDescriptor, ServerDescriptor, UidAndCloudDescriptor},
};

pub mod method {
	pub const SEND_MESSAGES: u8 = 6;
	pub const SEND_SERVER_DESCRIPTOR: u8 = 7;
	pub const SEND_SERVER_DESCRIPTORS: u8 = 8;
	pub const SEND_CLOUD: u8 = 9;
	pub const SEND_CLOUDS: u8 = 10;
	pub const REQUEST_TELEMETRY: u8 = 11;
}

/// Inbound calls a work server makes into a client. The `ReturnResultApi`
/// half of the original (`return_result`, `ExtApi`) is handled separately by
/// [`crate::correlation::ProtocolContext`] since it applies uniformly to
/// every API, not just this one.
#[derive(Default)]
pub struct ClientApiSafe {
	send_message_event: EventSource<AeMessage>,
	send_server_descriptor_event: EventSource<ServerDescriptor>,
	send_cloud_event: EventSource<(Uid, CloudDescriptor)>,
	request_telemetry_event: EventSource<()>,
}

impl ClientApiSafe {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn send_message_event(&self) -> &EventSource<AeMessage> {
		&self.send_message_event
	}

	pub fn send_server_descriptor_event(&self) -> &EventSource<ServerDescriptor> {
		&self.send_server_descriptor_event
	}

	pub fn send_cloud_event(&self) -> &EventSource<(Uid, CloudDescriptor)> {
		&self.send_cloud_event
	}

	pub fn request_telemetry_event(&self) -> &EventSource<()> {
		&self.request_telemetry_event
	}

	fn decode_fully<T: WireDecode>(&self, method_name: &'static str, mut body: Bytes) -> ApiResult<T> {
		let value = T::decode(&mut body)?.ok_or_else(|| ApiError::ProtocolViolation {
			api_name: Self::API_NAME,
			method_name,
			reason: "call ended before its arguments finished decoding".to_string(),
			backtrace: std::backtrace::Backtrace::capture(),
		})?;
		if !body.is_empty() {
			return Err(ApiError::ProtocolViolation {
				api_name: Self::API_NAME,
				method_name,
				reason: format!("{} trailing bytes after decoded arguments", body.len()),
				backtrace: std::backtrace::Backtrace::capture(),
			});
		}
		Ok(value)
	}
}

impl ApiDispatch for ClientApiSafe {
	const API_NAME: &'static str = "ClientApiSafe";

	fn dispatch(&self, method_id: u8, body: Bytes) -> ApiResult<()> {
		match method_id {
			method::SEND_MESSAGES => {
				let messages: Vec<AeMessage> = self.decode_fully("send_messages", body)?;
				for message in messages {
					self.send_message_event.emit(&message);
				}
			}
			method::SEND_SERVER_DESCRIPTOR => {
				let descriptor = decode_server_descriptor(body, "send_server_descriptor")?;
				self.send_server_descriptor_event.emit(&descriptor);
			}
			method::SEND_SERVER_DESCRIPTORS => {
				let descriptors = decode_server_descriptors(body)?;
				for descriptor in descriptors {
					self.send_server_descriptor_event.emit(&descriptor);
				}
			}
			method::SEND_CLOUD => {
				let mut rest = body;
				let start = rest.clone();
				let uid = Uid::decode(&mut rest).ok_or_else(|| ApiError::ProtocolViolation {
					api_name: Self::API_NAME,
					method_name: "send_cloud",
					reason: "uid did not decode fully".to_string(),
					backtrace: std::backtrace::Backtrace::capture(),
				})?;
				let _ = start;
				let cloud: CloudDescriptor = self.decode_fully("send_cloud", rest)?;
				self.send_cloud_event.emit(&(uid, cloud));
			}
			method::SEND_CLOUDS => {
				let clouds: Vec<UidAndCloudDescriptor> = self.decode_fully("send_clouds", body)?;
				for entry in clouds {
					self.send_cloud_event.emit(&(entry.uid, entry.cloud));
				}
			}
			method::REQUEST_TELEMETRY => {
				if !body.is_empty() {
					return Err(ApiError::ProtocolViolation {
						api_name: Self::API_NAME,
						method_name: "request_telemetry",
						reason: "expected no arguments".to_string(),
						backtrace: std::backtrace::Backtrace::capture(),
					});
				}
				self.request_telemetry_event.emit(&());
			}
			other => {
				return crate::error::UnknownMethodSnafu {
					api_name: Self::API_NAME,
					method_id: other,
				}
				.fail();
			}
		}
		Ok(())
	}
}

fn decode_server_descriptor(mut body: Bytes, method_name: &'static str) -> ApiResult<ServerDescriptor> {
	let descriptor = ServerDescriptor::decode(&mut body)?.ok_or_else(|| ApiError::ProtocolViolation {
		api_name: ClientApiSafe::API_NAME,
		method_name,
		reason: "descriptor did not decode fully".to_string(),
		backtrace: std::backtrace::Backtrace::capture(),
	})?;
	Ok(descriptor)
}

fn decode_server_descriptors(mut body: Bytes) -> ApiResult<Vec<ServerDescriptor>> {
	let start = body.clone();
	let Some(len) = aether_core::wire::decode_tiered(&mut body)? else {
		body = start;
		return ProtocolErrorHelper::short_read("send_server_descriptors", body.len());
	};
	let mut descriptors = Vec::with_capacity((len as usize).min(1 << 16));
	for _ in 0..len {
		match ServerDescriptor::decode(&mut body)? {
			Some(descriptor) => descriptors.push(descriptor),
			None => return ProtocolErrorHelper::short_read("send_server_descriptors", body.len()),
		}
	}
	Ok(descriptors)
}

struct ProtocolErrorHelper;
impl ProtocolErrorHelper {
	fn short_read<T>(method_name: &'static str, remaining: usize) -> ApiResult<T> {
		Err(ApiError::ProtocolViolation {
			api_name: ClientApiSafe::API_NAME,
			method_name,
			reason: format!("{remaining} bytes left but could not decode a complete value"),
			backtrace: std::backtrace::Backtrace::capture(),
		})
	}
}
