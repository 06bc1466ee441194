//! Cooperative single-threaded task runtime (`spec.md` §4.1, C1). Grounded on
//! the `Action`/`UpdateStatus`/`StateMachine<State>` "changed-gate" pattern
//! described in `spec.md` §4.1 and exercised by
//! `original_source/aether/actions/promise_action.h`. No direct Rust teacher
//! file exists for this component — `wind` drives its state machines with
//! bare `tokio::select!` loops (see `wind-tuic::task::ClientTaskExt`) rather
//! than a cooperative scheduler, so this module is built to the spec and
//! kept deliberately stdlib-only: it is an internal primitive the rest of the
//! crate graph depends on, not an ambient concern that should reach for a
//! crate.
//!
//! `spec.md` §9 replaces the original's shared-ownership smart pointers with
//! "an owner holding a value and subscribers holding a handle" — that is
//! exactly how [`ActionPtr`] works: cloning it shares ownership (`Arc`), and
//! [`ActionPtr::subscribe`] returns a [`Subscription`] handle independent of
//! that ownership. A subscriber that wants the action kept alive for as long
//! as its subscription holds the clone of [`ActionPtr`] alongside the
//! `Subscription`, rather than the framework doing it implicitly.

use std::{
	cmp::Reverse,
	collections::{BinaryHeap, VecDeque},
	sync::{
		Arc, Mutex, Weak,
		atomic::{AtomicU64, Ordering},
	},
	time::Instant,
};

use crate::event::{EventSource, Subscription};

/// Outcome of one [`Action::update`] call. An action is terminal exactly once
/// it returns `Result`, `Error`, or `Stop` — subsequent calls are a contract
/// violation and the scheduler will not make them.
pub enum UpdateStatus {
	/// Keep the action registered; optionally wake it again at the given
	/// instant (in addition to any future `Trigger()`).
	Continue(Option<Instant>),
	/// Equivalent to `Continue(Some(at))` — the explicit spelling `spec.md`
	/// §4.1 uses for timeout-style waits.
	Delay(Instant),
	/// Terminal: succeeded.
	Result,
	/// Terminal: failed. Implementations must never let an error escape
	/// `update()` as a panic or exception — translate it into this variant
	/// instead (`spec.md` §4.1 "Failure").
	Error,
	/// Terminal: cancelled via [`ActionPtr::stop`].
	Stop,
}

pub trait Action: Send {
	fn update(&mut self, now: Instant) -> UpdateStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
	Result,
	Error,
	Stop,
}

struct CellState {
	next_wake: Option<Instant>,
	terminal: bool,
	stop_requested: bool,
}

struct ActionCell<A> {
	id: u64,
	action: Mutex<A>,
	status: EventSource<ActionStatus>,
	state: Mutex<CellState>,
}

trait ErasedCell: Send + Sync {
	fn id(&self) -> u64;
	fn is_terminal(&self) -> bool;
	fn poll(&self, now: Instant) -> Option<Instant>;
}

impl<A: Action + 'static> ErasedCell for ActionCell<A> {
	fn id(&self) -> u64 {
		self.id
	}

	fn is_terminal(&self) -> bool {
		self.state.lock().unwrap().terminal
	}

	fn poll(&self, now: Instant) -> Option<Instant> {
		if self.is_terminal() {
			return None;
		}
		let stop_requested = {
			let mut state = self.state.lock().unwrap();
			std::mem::take(&mut state.stop_requested)
		};
		let status = if stop_requested {
			UpdateStatus::Stop
		} else {
			self.action.lock().unwrap().update(now)
		};
		match status {
			UpdateStatus::Continue(next) => {
				self.state.lock().unwrap().next_wake = next;
				next
			}
			UpdateStatus::Delay(at) => {
				self.state.lock().unwrap().next_wake = Some(at);
				Some(at)
			}
			UpdateStatus::Result => {
				self.finish(ActionStatus::Result);
				None
			}
			UpdateStatus::Error => {
				self.finish(ActionStatus::Error);
				None
			}
			UpdateStatus::Stop => {
				self.finish(ActionStatus::Stop);
				None
			}
		}
	}
}

impl<A> ActionCell<A> {
	fn finish(&self, status: ActionStatus) {
		let mut state = self.state.lock().unwrap();
		if state.terminal {
			return;
		}
		state.terminal = true;
		state.next_wake = None;
		drop(state);
		self.status.emit(&status);
	}
}

/// A shared handle to a running action (`spec.md` §4.1 `ActionPtr<T>`). The
/// action is polled by the [`Scheduler`] it was created on until it reaches a
/// terminal state or every `ActionPtr`/`OwnActionPtr` clone is dropped.
pub struct ActionPtr<A> {
	cell: Arc<ActionCell<A>>,
	scheduler: SchedulerHandle,
}

impl<A> Clone for ActionPtr<A> {
	fn clone(&self) -> Self {
		Self {
			cell: self.cell.clone(),
			scheduler: self.scheduler.clone(),
		}
	}
}

/// `spec.md`'s `OwnActionPtr<T>` — a type alias in this rewrite, since Rust's
/// ownership already distinguishes "I created this" from "I was handed a
/// clone" at the borrow-checker level; the C++ original needed a distinct
/// type to express that same intent through a shared-pointer API.
pub type OwnActionPtr<A> = ActionPtr<A>;

impl<A: Action + 'static> ActionPtr<A> {
	/// Schedules `self` to be polled on the scheduler's next tick — used by
	/// callbacks from other actions or I/O completions to wake a suspended
	/// action (`spec.md` §4.1 `Trigger()`).
	pub fn trigger(&self) {
		self.scheduler.trigger(self.cell.clone());
	}

	/// Drives the action to a terminal `Stop` on the next tick. Best-effort:
	/// the action's own `update()` is not interrupted mid-call, but it will
	/// not be polled again after stopping (`spec.md` §5 "Cancellation &
	/// timeouts").
	pub fn stop(&self) {
		self.cell.state.lock().unwrap().stop_requested = true;
		self.trigger();
	}

	pub fn is_terminal(&self) -> bool {
		self.cell.is_terminal()
	}

	/// Registers `on_result`/`on_error`/`on_stop` callbacks against this
	/// action's terminal status event (`spec.md` §4.1
	/// `StatusEvent().Subscribe(...)`). Exactly one callback fires, exactly
	/// once.
	#[must_use = "dropping the subscription immediately unsubscribes it"]
	pub fn subscribe(
		&self,
		mut on_result: impl FnMut() + Send + 'static,
		mut on_error: impl FnMut() + Send + 'static,
		mut on_stop: impl FnMut() + Send + 'static,
	) -> Subscription {
		self.cell.status.subscribe(move |status| match status {
			ActionStatus::Result => on_result(),
			ActionStatus::Error => on_error(),
			ActionStatus::Stop => on_stop(),
		})
	}

	pub fn with_inner<R>(&self, f: impl FnOnce(&A) -> R) -> R {
		f(&self.cell.action.lock().unwrap())
	}

	pub fn with_inner_mut<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
		f(&mut self.cell.action.lock().unwrap())
	}
}

struct HeapEntry {
	at: Instant,
	id: u64,
	cell: Weak<dyn ErasedCell>,
}

impl PartialEq for HeapEntry {
	fn eq(&self, other: &Self) -> bool {
		self.at == other.at && self.id == other.id
	}
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for HeapEntry {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(self.at, self.id).cmp(&(other.at, other.id))
	}
}

struct SchedulerInner {
	next_id: AtomicU64,
	heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
	triggered: Mutex<VecDeque<Weak<dyn ErasedCell>>>,
}

#[derive(Clone)]
struct SchedulerHandle(Arc<SchedulerInner>);

impl SchedulerHandle {
	fn trigger(&self, cell: Arc<dyn ErasedCell>) {
		self.0.triggered.lock().unwrap().push_back(Arc::downgrade(&cell));
	}

	fn schedule_at(&self, at: Instant, id: u64, cell: Weak<dyn ErasedCell>) {
		self.0.heap.lock().unwrap().push(Reverse(HeapEntry { at, id, cell }));
	}
}

/// Drives every live action registered against it. The application owns one
/// `Scheduler` and repeatedly calls [`Scheduler::tick`]; `spec.md` §5 leaves
/// the blocking wait between ticks (epoll/kqueue/IOCP/timer sleep) to the
/// embedding platform — in this crate that is simply `tokio::time::sleep`
/// until the returned `next_wake`.
pub struct Scheduler {
	inner: SchedulerHandle,
}

impl Default for Scheduler {
	fn default() -> Self {
		Self::new()
	}
}

impl Scheduler {
	pub fn new() -> Self {
		Self {
			inner: SchedulerHandle(Arc::new(SchedulerInner {
				next_id: AtomicU64::new(0),
				heap: Mutex::new(BinaryHeap::new()),
				triggered: Mutex::new(VecDeque::new()),
			})),
		}
	}

	/// Registers a new action and polls it once immediately, matching the
	/// original's "actions run their first `Update()` synchronously on
	/// construction" convention.
	pub fn spawn<A: Action + 'static>(&self, action: A) -> ActionPtr<A> {
		let id = self.inner.0.next_id.fetch_add(1, Ordering::Relaxed);
		let cell = Arc::new(ActionCell {
			id,
			action: Mutex::new(action),
			status: EventSource::new(),
			state: Mutex::new(CellState {
				next_wake: None,
				terminal: false,
				stop_requested: false,
			}),
		});
		let ptr = ActionPtr {
			cell: cell.clone(),
			scheduler: self.inner.clone(),
		};
		self.inner.trigger(cell as Arc<dyn ErasedCell>);
		ptr
	}

	/// Drains triggered actions, then pops every due heap entry, matching
	/// `spec.md` §4.1's tick algorithm. Returns the next instant a
	/// currently-scheduled action wants to be woken, if any — callers should
	/// sleep until then (or until the next external event) before calling
	/// `tick` again.
	pub fn tick(&self, now: Instant) -> Option<Instant> {
		let mut triggered = std::mem::take(&mut *self.inner.0.triggered.lock().unwrap());
		while let Some(weak) = triggered.pop_front() {
			if let Some(cell) = weak.upgrade() {
				if let Some(next) = cell.poll(now) {
					self.inner.schedule_at(next, cell.id(), Arc::downgrade(&cell));
				}
			}
		}

		loop {
			let due = {
				let mut heap = self.inner.0.heap.lock().unwrap();
				match heap.peek() {
					Some(Reverse(entry)) if entry.at <= now => heap.pop(),
					_ => None,
				}
			};
			let Some(Reverse(entry)) = due else { break };
			let Some(cell) = entry.cell.upgrade() else { continue };
			if let Some(next) = cell.poll(now) {
				self.inner.schedule_at(next, cell.id(), Arc::downgrade(&cell));
			}
		}

		self.inner.0.heap.lock().unwrap().peek().map(|Reverse(e)| e.at)
	}
}

#[cfg(test)]
mod test {
	use std::{
		sync::atomic::{AtomicBool, AtomicU32, Ordering},
		time::Duration,
	};

	use super::*;

	struct Once;
	impl Action for Once {
		fn update(&mut self, _now: Instant) -> UpdateStatus {
			UpdateStatus::Result
		}
	}

	#[test]
	fn spawn_polls_immediately_and_reaches_terminal() {
		let scheduler = Scheduler::new();
		let action = scheduler.spawn(Once);
		let done = Arc::new(AtomicBool::new(false));
		let d = done.clone();
		let _sub = action.subscribe(move || d.store(true, Ordering::SeqCst), || {}, || {});
		scheduler.tick(Instant::now());
		assert!(done.load(Ordering::SeqCst));
		assert!(action.is_terminal());
	}

	struct CountToThree {
		count: u32,
	}
	impl Action for CountToThree {
		fn update(&mut self, _now: Instant) -> UpdateStatus {
			self.count += 1;
			if self.count >= 3 {
				UpdateStatus::Result
			} else {
				UpdateStatus::Delay(Instant::now() + Duration::from_millis(1))
			}
		}
	}

	#[test]
	fn delay_reschedules_until_terminal() {
		let scheduler = Scheduler::new();
		let action = scheduler.spawn(CountToThree { count: 0 });
		let mut now = Instant::now();
		scheduler.tick(now);
		assert!(!action.is_terminal());
		for _ in 0..5 {
			now += Duration::from_millis(2);
			scheduler.tick(now);
			if action.is_terminal() {
				break;
			}
		}
		assert!(action.is_terminal());
		assert_eq!(action.with_inner(|a| a.count), 3);
	}

	struct Never;
	impl Action for Never {
		fn update(&mut self, _now: Instant) -> UpdateStatus {
			UpdateStatus::Continue(None)
		}
	}

	#[test]
	fn stop_drives_action_to_terminal_stop() {
		let scheduler = Scheduler::new();
		let action = scheduler.spawn(Never);
		scheduler.tick(Instant::now());
		assert!(!action.is_terminal());

		let stopped = Arc::new(AtomicU32::new(0));
		let s = stopped.clone();
		let _sub = action.subscribe(|| {}, || {}, move || {
			s.fetch_add(1, Ordering::SeqCst);
		});
		action.stop();
		scheduler.tick(Instant::now());
		assert!(action.is_terminal());
		assert_eq!(stopped.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn dropping_every_handle_lets_action_be_collected() {
		let scheduler = Scheduler::new();
		let weak = {
			let action = scheduler.spawn(Never);
			scheduler.tick(Instant::now());
			Arc::downgrade(&action.cell)
		};
		// No ActionPtr left alive: the scheduler only held a Weak reference,
		// so the action is gone even though it never reached a terminal
		// state.
		assert!(weak.upgrade().is_none());
	}
}
