use std::backtrace::Backtrace;

use snafu::prelude::*;

/// `spec.md` §7 taxonomy, scoped to C5 adapter/access-point/channel concerns.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ChannelError {
	#[snafu(display("access-point connect failed: {reason}"))]
	AccessPointConnect { reason: String, backtrace: Backtrace },

	#[snafu(display("DNS resolution of {name} failed: {reason}"))]
	Resolve { name: String, reason: String, backtrace: Backtrace },

	#[snafu(display("transport build failed: {source}"))]
	Transport {
		source: aether_transport::TransportError,
		backtrace: Backtrace,
	},

	#[snafu(display("transport build timed out after {budget:?}"))]
	Timeout { budget: std::time::Duration, backtrace: Backtrace },

	#[snafu(display("all {count} candidate channels failed"))]
	AllChannelsFailed { count: usize, backtrace: Backtrace },

	#[snafu(display("no candidate channels available"))]
	NoChannels { backtrace: Backtrace },

	#[snafu(display("unsupported protocol under current build: {protocol:?}"))]
	Configuration { protocol: String, backtrace: Backtrace },
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// [`ChannelError`] has no [`Clone`] impl (its `Backtrace` fields aren't
/// `Clone`), but `Channel::transport_builder`'s dedup needs a cloneable
/// failure to hand back to every waiter sharing one in-flight build
/// (`spec.md` §3 "concurrent requests share the same outstanding action").
/// This is the cloneable form stored in the shared future; every waiter maps
/// it back into a fresh [`ChannelError`] to surface.
#[derive(Debug, Clone)]
pub struct SharedFailure(pub std::sync::Arc<str>);

impl From<&ChannelError> for SharedFailure {
	fn from(err: &ChannelError) -> Self {
		SharedFailure(err.to_string().into())
	}
}

impl From<SharedFailure> for ChannelError {
	fn from(failure: SharedFailure) -> Self {
		ChannelError::AccessPointConnect {
			reason: failure.0.to_string(),
			backtrace: Backtrace::capture(),
		}
	}
}
