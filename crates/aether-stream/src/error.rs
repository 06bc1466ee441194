use std::backtrace::Backtrace;

use snafu::prelude::*;

/// Gate and safe-stream failures (`spec.md` §7: `CryptoFailure`,
/// `ProtocolViolation`, and the safe-stream share of `Timeout`).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StreamError {
	#[snafu(display("AEAD operation failed: {reason}"))]
	Crypto { reason: String, backtrace: Backtrace },

	#[snafu(display("malformed frame: {reason}"))]
	ProtocolViolation { reason: String, backtrace: Backtrace },

	#[snafu(display("write of {len} bytes exceeds max_data_size {max}"))]
	WriteTooLarge { len: usize, max: usize, backtrace: Backtrace },

	#[snafu(display("safe-stream exhausted {attempts} retransmit attempts for seq {seq}"))]
	RetriesExhausted { seq: u16, attempts: u32, backtrace: Backtrace },

	#[snafu(display("underlying stream reported a link error"))]
	LinkError { backtrace: Backtrace },

	#[snafu(context(false))]
	Core { source: aether_core::error::CoreError },
}

pub type StreamResult<T> = Result<T, StreamError>;
