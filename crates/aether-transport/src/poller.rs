//! C4.1 poller (`spec.md` §4.3): abstracts the OS event source shared by
//! socket transports. Socket-backed drivers (TCP, UDP) use tokio's own
//! reactor directly via `tokio::io::Interest`/`.readable()`/`.writable()` —
//! `spec.md` §9 explicitly allows mapping this platform abstraction to
//! "build-time features/conditional compilation or runtime traits", and
//! tokio's reactor already *is* a poller in a Rust rewrite. This module
//! exists for drivers whose "descriptor" has no OS file descriptor behind
//! it — modem and LoRa connection indices — which are bridged into the
//! scheduler through an ordinary `tokio::sync::mpsc` channel instead.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerEventKind {
	Read,
	Write,
	Error,
}

#[derive(Debug, Clone)]
pub struct PollerEvent<D> {
	pub descriptor: D,
	pub kind: PollerEventKind,
}

/// The write side handed to a driver implementation (`IModemDriver`,
/// `ILoraDriver`) so its callback can notify the transport without either
/// side blocking.
#[derive(Clone)]
pub struct PollerHandle<D> {
	tx: mpsc::UnboundedSender<PollerEvent<D>>,
}

impl<D> PollerHandle<D> {
	/// Best-effort: if the receiving transport has already been dropped this
	/// is a no-op, matching `spec.md` §5 "disconnection is idempotent".
	pub fn notify(&self, descriptor: D, kind: PollerEventKind) {
		let _ = self.tx.send(PollerEvent { descriptor, kind });
	}
}

/// The read side owned by the transport driver.
pub struct ChannelPoller<D> {
	rx: mpsc::UnboundedReceiver<PollerEvent<D>>,
}

impl<D> ChannelPoller<D> {
	pub fn new() -> (Self, PollerHandle<D>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { rx }, PollerHandle { tx })
	}

	pub async fn recv(&mut self) -> Option<PollerEvent<D>> {
		self.rx.recv().await
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn handle_notify_is_observed_by_poller() {
		let (mut poller, handle) = ChannelPoller::<u32>::new();
		handle.notify(7, PollerEventKind::Read);
		let event = poller.recv().await.expect("event delivered");
		assert_eq!(event.descriptor, 7);
		assert_eq!(event.kind, PollerEventKind::Read);
	}

	#[tokio::test]
	async fn dropped_poller_makes_notify_a_no_op() {
		let (poller, handle) = ChannelPoller::<u32>::new();
		drop(poller);
		handle.notify(1, PollerEventKind::Error);
	}
}
