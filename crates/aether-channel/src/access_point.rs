//! Access-point layer (`spec.md` §3, §4.4): the logical attachment point of
//! an [`Adapter`](crate::adapter::Adapter) — a specific Wi-Fi SSID, a modem's
//! APN, a LoRa module's radio configuration. Grounded on
//! `original_source/aether/access_points/access_point.h`'s `Connect()`
//! dedup contract.

use std::{sync::Arc, time::Duration};

use aether_core::types::Endpoint;
use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::{
	channel::Channel,
	error::{ChannelError, ChannelResult, SharedFailure},
};

pub type AccessPointId = u32;

/// Per-medium connect behavior injected into an [`AccessPoint`] — a Wi-Fi
/// driver associating to an SSID, a modem registering on its network, a
/// LoRa module initializing its radio. Out of `spec.md` §1's scope (link
/// driver internals); only the contract is specified here.
pub trait AccessPointDriver: Send + Sync {
	/// Ensures the adapter is attached to this access point. Called at most
	/// once per in-flight connect thanks to [`AccessPoint::connect`]'s dedup.
	fn connect(&self) -> BoxFuture<'static, Result<(), String>>;
}

type SharedConnect = Shared<BoxFuture<'static, Result<(), SharedFailure>>>;

/// `spec.md` §4.4: "connect() returns a connect-action that is deduplicated:
/// repeated callers while the action is in progress receive the same action
/// handle; on completion, the action is released and subsequent calls may
/// create a new one."
pub struct AccessPoint {
	id: AccessPointId,
	driver: Arc<dyn AccessPointDriver>,
	inflight: ArcSwapOption<SharedConnect>,
}

impl AccessPoint {
	pub fn new(id: AccessPointId, driver: Arc<dyn AccessPointDriver>) -> Arc<Self> {
		Arc::new(Self {
			id,
			driver,
			inflight: ArcSwapOption::empty(),
		})
	}

	pub fn id(&self) -> AccessPointId {
		self.id
	}

	/// Connects the adapter to this access point, or attaches to an
	/// already-in-flight connect (`spec.md` §4.4). The returned future is
	/// released from `inflight` once it resolves, so a fresh call afterwards
	/// starts a new connect attempt rather than replaying the cached result.
	pub async fn connect(self: &Arc<Self>) -> ChannelResult<()> {
		let shared = match self.inflight.load_full() {
			Some(existing) => existing.as_ref().clone(),
			None => {
				let driver = self.driver.clone();
				let fut: BoxFuture<'static, Result<(), SharedFailure>> = async move {
					driver
						.connect()
						.await
						.map_err(|reason| SharedFailure(reason.into()))
				}
				.boxed();
				let shared = fut.shared();
				self.inflight.store(Some(Arc::new(shared.clone())));
				shared
			}
		};

		let result = shared.await;
		// Release the slot once this connect settles so the next caller (after
		// completion) starts fresh instead of replaying a stale cached result.
		// A racing caller that loaded the same `shared` before this clears it
		// still correctly awaits the value it already captured.
		self.inflight.store(None);
		result.map_err(ChannelError::from)
	}

	/// Builds the set of [`Channel`]s this access point can reach
	/// `endpoints` through (`spec.md` §4.4 `generate_channels`).
	pub fn generate_channels(
		self: &Arc<Self>,
		endpoints: &[Endpoint],
		adapter: Arc<crate::adapter::Adapter>,
		properties: crate::channel::ChannelTransportProperties,
		connect_window: usize,
		response_window: usize,
	) -> Vec<Arc<Channel>> {
		endpoints
			.iter()
			.map(|endpoint| Channel::new(endpoint.clone(), adapter.clone(), self.clone(), properties, connect_window, response_window))
			.collect()
	}
}

/// Default timeout floor used before a channel has accumulated enough
/// connect-time samples (`spec.md` §4.4 `AE_DEFAULT_CONNECTION_TIMEOUT_MS`).
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(50_000);

#[cfg(test)]
mod test {
	use std::sync::{
		Arc as StdArc,
		atomic::{AtomicUsize, Ordering},
	};

	use super::*;

	struct CountingDriver {
		calls: StdArc<AtomicUsize>,
		fail: bool,
	}

	impl AccessPointDriver for CountingDriver {
		fn connect(&self) -> BoxFuture<'static, Result<(), String>> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			let fail = self.fail;
			Box::pin(async move {
				tokio::time::sleep(Duration::from_millis(5)).await;
				if fail { Err("simulated failure".to_string()) } else { Ok(()) }
			})
		}
	}

	#[tokio::test]
	async fn concurrent_connects_share_one_in_flight_call() {
		let calls = StdArc::new(AtomicUsize::new(0));
		let ap = AccessPoint::new(1, Arc::new(CountingDriver { calls: calls.clone(), fail: false }));

		let a = ap.clone();
		let b = ap.clone();
		let (r1, r2) = tokio::join!(async move { a.connect().await }, async move { b.connect().await });
		assert!(r1.is_ok());
		assert!(r2.is_ok());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn sequential_connects_after_completion_start_fresh() {
		let calls = StdArc::new(AtomicUsize::new(0));
		let ap = AccessPoint::new(1, Arc::new(CountingDriver { calls: calls.clone(), fail: false }));

		ap.connect().await.unwrap();
		ap.connect().await.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn failed_connect_surfaces_to_every_waiter() {
		let calls = StdArc::new(AtomicUsize::new(0));
		let ap = AccessPoint::new(1, Arc::new(CountingDriver { calls, fail: true }));
		let a = ap.clone();
		let b = ap.clone();
		let (r1, r2) = tokio::join!(async move { a.connect().await }, async move { b.connect().await });
		assert!(r1.is_err());
		assert!(r2.is_err());
	}
}
