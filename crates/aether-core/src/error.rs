use std::backtrace::Backtrace;

use snafu::prelude::*;

/// Error taxonomy shared by every layer of the engine (`spec.md` §7). Each
/// downstream crate defines its own `Error` enum scoped to its own concerns;
/// this one covers failures that originate in the foundation crate itself
/// (wire codec, scheduler, event bus).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoreError {
	#[snafu(display("tiered-int value {value} exceeds the encodable range"))]
	TieredIntOverflow { value: u64, backtrace: Backtrace },

	#[snafu(display("buffer underrun decoding {what}: need {need} bytes, have {have}"))]
	BufferUnderrun {
		what: &'static str,
		need: usize,
		have: usize,
		backtrace: Backtrace,
	},

	#[snafu(display("malformed frame: {reason}"))]
	ProtocolViolation { reason: String, backtrace: Backtrace },

	#[snafu(display("transport failure: {reason}"))]
	TransportFailure { reason: String, backtrace: Backtrace },

	#[snafu(display("{what} string is not valid UTF-8"))]
	InvalidUtf8 {
		what: &'static str,
		source: std::str::Utf8Error,
		backtrace: Backtrace,
	},

	#[snafu(display("write refused: {buffered}/{capacity} already buffered"))]
	Backpressure {
		buffered: usize,
		capacity: usize,
		backtrace: Backtrace,
	},
}

pub type CoreResult<T> = Result<T, CoreError>;
