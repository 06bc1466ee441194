use std::backtrace::Backtrace;

use snafu::prelude::*;

/// `spec.md` §7 taxonomy, scoped to C9/C10/C11 concerns: server-connection
/// lifecycle, peer-stream routing, and registration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
	#[snafu(display("server {server_id} rejected login: {reason}"))]
	Unauthorized { server_id: u32, reason: String, backtrace: Backtrace },

	#[snafu(display("no server connection is currently authorized"))]
	NoAuthorizedServer { backtrace: Backtrace },

	#[snafu(display("at most {max} concurrent server connections are permitted"))]
	ResourceExhausted { max: usize, backtrace: Backtrace },

	#[snafu(display("registration step {step} failed: {reason}"))]
	Registration { step: &'static str, reason: String, backtrace: Backtrace },

	#[snafu(context(false))]
	Channel { source: aether_channel::ChannelError },

	#[snafu(context(false))]
	Api { source: aether_api::ApiError },

	#[snafu(context(false))]
	Stream { source: aether_stream::StreamError },

	#[snafu(context(false))]
	Core { source: aether_core::error::CoreError },
}

pub type ClientResult<T> = Result<T, ClientError>;
