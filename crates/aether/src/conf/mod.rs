//! Persistent (on-disk) configuration and the runtime configuration derived
//! from it, grounded on `wind::conf::{persistent, runtime}`'s two-stage
//! shape: a serde-friendly `PersistentConfig` loaded via `figment`, resolved
//! once at startup into a `RuntimeConfig` the rest of the binary consumes.

pub mod persistent;
pub mod runtime;

pub use persistent::PersistentConfig;
pub use runtime::RuntimeConfig;
