//! Adapter layer (`spec.md` §3, §4.4): one per physical medium (Wi-Fi,
//! cellular, LoRa, Ethernet). No generic `Adapter`/`AdapterRegistry`
//! counterpart exists under `original_source` — only medium-specific
//! adapters such as `aether/adapters/lora_module_adapter.h` are present, each
//! folding adapter and access-point bookkeeping together. This module is
//! hand-built to `spec.md` §4.4's medium-agnostic `Adapter` type instead.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwapOption;

use crate::access_point::AccessPoint;

pub type AdapterId = u32;

/// One physical medium. Owns its [`AccessPoint`]s and tracks which one (if
/// any) is currently attached — `spec.md` §4.4: "At most one active AP per
/// adapter at a time".
pub struct Adapter {
	id: AdapterId,
	access_points: Vec<Arc<AccessPoint>>,
	active: ArcSwapOption<AccessPoint>,
}

impl Adapter {
	/// Constructed once at startup from configuration and lives for the
	/// process lifetime (`spec.md` §3 "Adapter" lifecycle).
	pub fn new(id: AdapterId, access_points: Vec<Arc<AccessPoint>>) -> Arc<Self> {
		Arc::new(Self {
			id,
			access_points,
			active: ArcSwapOption::empty(),
		})
	}

	pub fn id(&self) -> AdapterId {
		self.id
	}

	pub fn access_points(&self) -> &[Arc<AccessPoint>] {
		&self.access_points
	}

	pub fn access_point(&self, id: crate::access_point::AccessPointId) -> Option<Arc<AccessPoint>> {
		self.access_points.iter().find(|ap| ap.id() == id).cloned()
	}

	/// Marks `access_point` as the currently-attached one, per the
	/// "at most one active AP" invariant. Called by a channel's transport
	/// builder after `AccessPoint::connect()` succeeds.
	pub fn set_active(&self, access_point: Arc<AccessPoint>) {
		self.active.store(Some(access_point));
	}

	pub fn active_access_point(&self) -> Option<Arc<AccessPoint>> {
		self.active.load_full()
	}
}

/// Holds every configured [`Adapter`] by a stable id (`spec.md` §4.4
/// `AdapterRegistry`).
#[derive(Default)]
pub struct AdapterRegistry {
	adapters: HashMap<AdapterId, Arc<Adapter>>,
}

impl AdapterRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, adapter: Arc<Adapter>) {
		self.adapters.insert(adapter.id(), adapter);
	}

	pub fn get(&self, id: AdapterId) -> Option<Arc<Adapter>> {
		self.adapters.get(&id).cloned()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<Adapter>> {
		self.adapters.values()
	}
}
