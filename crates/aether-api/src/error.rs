use std::backtrace::Backtrace;

use snafu::prelude::*;

/// `spec.md` §7 taxonomy, scoped to C8 method-dispatch concerns.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ApiError {
	#[snafu(display("unknown method id {method_id} on {api_name}"))]
	UnknownMethod { api_name: &'static str, method_id: u8, backtrace: Backtrace },

	#[snafu(display("malformed call to {api_name}::{method_name}: {reason}"))]
	ProtocolViolation {
		api_name: &'static str,
		method_name: &'static str,
		reason: String,
		backtrace: Backtrace,
	},

	#[snafu(display("promise for correlation id {correlation_id} was dropped before a result arrived"))]
	PromiseDropped { correlation_id: u32, backtrace: Backtrace },

	#[snafu(display("remote returned an error for correlation id {correlation_id}: {message}"))]
	RemoteError { correlation_id: u32, message: String, backtrace: Backtrace },

	#[snafu(context(false))]
	Core { source: aether_core::error::CoreError },
}

pub type ApiResult<T> = Result<T, ApiError>;
