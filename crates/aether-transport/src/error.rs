use std::backtrace::Backtrace;

use snafu::prelude::*;

/// `spec.md` §7 taxonomy, scoped to C4 transport drivers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
	#[snafu(display("connect to {addr} failed: {source}"))]
	Connect {
		addr: String,
		source: std::io::Error,
		backtrace: Backtrace,
	},

	#[snafu(display("transport I/O error: {source}"))]
	Io {
		source: std::io::Error,
		backtrace: Backtrace,
	},

	#[snafu(display("write of {len} bytes exceeds datagram max size {max}"))]
	DatagramTooLarge { len: usize, max: usize, backtrace: Backtrace },

	#[snafu(display("transport is not linked, writes are not accepted"))]
	NotLinked { backtrace: Backtrace },

	#[snafu(display("driver error: {reason}"))]
	Driver { reason: String, backtrace: Backtrace },

	#[snafu(display("malformed frame: {reason}"))]
	ProtocolViolation { reason: String, backtrace: Backtrace },

	#[snafu(display("unsupported protocol under current build: {protocol:?}"))]
	Configuration { protocol: String, backtrace: Backtrace },
}

pub type TransportResult<T> = Result<T, TransportError>;

impl From<aether_core::error::CoreError> for TransportError {
	fn from(source: aether_core::error::CoreError) -> Self {
		TransportError::ProtocolViolation {
			reason: source.to_string(),
			backtrace: Backtrace::capture(),
		}
	}
}

impl From<TransportError> for aether_core::error::CoreError {
	fn from(source: TransportError) -> Self {
		match source {
			TransportError::ProtocolViolation { reason, backtrace } => {
				aether_core::error::CoreError::ProtocolViolation { reason, backtrace }
			}
			other => aether_core::error::CoreError::TransportFailure {
				reason: other.to_string(),
				backtrace: Backtrace::capture(),
			},
		}
	}
}
