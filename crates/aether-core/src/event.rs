//! Multicast event sources with subscription-lifetime tokens (`spec.md` §2
//! C2, §4 "Event bus & delegates"), grounded on
//! `original_source/aether/events/delegate.h` and `events/event_list.h`.
//!
//! A [`Subscription`] owns its callback slot; dropping it removes the
//! callback, synchronized with [`EventSource::emit`] so emission never calls
//! into a slot whose subscription has already been dropped (`spec.md` §9:
//! "each subscription owns its slot and clears it on drop"). Emission
//! iterates a snapshot of the current subscriber list so a subscriber adding
//! or removing subscriptions during its own callback cannot corrupt the
//! in-progress emission (`spec.md` §5: "subscribers that wish to defer work
//! must schedule an action").

use std::sync::{
	Arc, Mutex,
	atomic::{AtomicU64, Ordering},
};

type Callback<T> = Box<dyn FnMut(&T) + Send + 'static>;

struct Slot<T> {
	id: u64,
	callback: Callback<T>,
}

struct Inner<T> {
	slots: Vec<Slot<T>>,
}

/// A multicast event source. `T` is the event payload type (e.g. the bytes
/// delivered by `out_data_event`, or the new `StreamInfo` for
/// `stream_update_event`).
pub struct EventSource<T> {
	inner: Arc<Mutex<Inner<T>>>,
	next_id: AtomicU64,
}

impl<T> Default for EventSource<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> EventSource<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner { slots: Vec::new() })),
			next_id: AtomicU64::new(0),
		}
	}

	/// Registers `callback`, returning a [`Subscription`] handle. The
	/// callback fires on every subsequent [`emit`](Self::emit) call until the
	/// handle is dropped.
	#[must_use = "dropping the subscription immediately unsubscribes it"]
	pub fn subscribe(&self, callback: impl FnMut(&T) + Send + 'static) -> Subscription {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.inner.lock().unwrap().slots.push(Slot {
			id,
			callback: Box::new(callback),
		});
		Subscription {
			id,
			inner: Arc::downgrade(&self.inner) as _,
		}
	}

	/// Fires every live subscriber synchronously, in subscription order
	/// (`spec.md` §5).
	pub fn emit(&self, value: &T) {
		// Snapshot the slot ids up front so a callback that subscribes or
		// unsubscribes mid-emit doesn't see a half-updated Vec.
		let mut guard = self.inner.lock().unwrap();
		let len = guard.slots.len();
		for i in 0..len {
			if i >= guard.slots.len() {
				break; // a callback dropped later subscriptions during emit
			}
			// Temporarily take the callback out so a re-entrant emit() from
			// inside the callback doesn't deadlock on the same mutex.
			let mut slot = std::mem::replace(
				&mut guard.slots[i],
				Slot {
					id: u64::MAX,
					callback: Box::new(|_| {}),
				},
			);
			drop(guard);
			(slot.callback)(value);
			guard = self.inner.lock().unwrap();
			if let Some(existing) = guard.slots.iter_mut().find(|s| s.id == slot.id) {
				*existing = slot;
			}
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.inner.lock().unwrap().slots.len()
	}
}

/// Dropping the handle unsubscribes its callback. Subscriptions are
/// otherwise inert — they carry no API beyond lifetime ownership.
pub struct Subscription {
	id: u64,
	inner: std::sync::Weak<dyn ErasedInner>,
}

trait ErasedInner: Send + Sync {
	fn remove(&self, id: u64);
}

impl<T: Send + 'static> ErasedInner for Mutex<Inner<T>> {
	fn remove(&self, id: u64) {
		let mut guard = self.lock().unwrap();
		guard.slots.retain(|slot| slot.id != id);
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(inner) = self.inner.upgrade() {
			inner.remove(self.id);
		}
	}
}

#[cfg(test)]
mod test {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn subscribers_fire_in_subscription_order() {
		let source = EventSource::<u32>::new();
		let order = Arc::new(Mutex::new(Vec::new()));

		let o1 = order.clone();
		let _s1 = source.subscribe(move |v| o1.lock().unwrap().push((1, *v)));
		let o2 = order.clone();
		let _s2 = source.subscribe(move |v| o2.lock().unwrap().push((2, *v)));

		source.emit(&42);
		assert_eq!(*order.lock().unwrap(), vec![(1, 42), (2, 42)]);
	}

	#[test]
	fn dropping_subscription_stops_delivery() {
		let source = EventSource::<u32>::new();
		let count = Arc::new(AtomicUsize::new(0));
		let c = count.clone();
		let sub = source.subscribe(move |_| {
			c.fetch_add(1, Ordering::SeqCst);
		});
		source.emit(&1);
		drop(sub);
		source.emit(&2);
		assert_eq!(count.load(Ordering::SeqCst), 1);
		assert_eq!(source.subscriber_count(), 0);
	}
}
