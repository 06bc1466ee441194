//! Adapter → access-point → channel → transport topology (`spec.md` §2 C5,
//! §3, §4.4). Builds the concrete [`aether_core::stream::ByteStream`] a
//! channel resolves to on demand and tracks per-channel connect/response
//! statistics used to order and time out candidate channels.

pub mod access_point;
pub mod adapter;
pub mod channel;
pub mod error;
pub mod factory;
pub mod selection;

pub use access_point::{AccessPoint, AccessPointDriver, AccessPointId};
pub use adapter::{Adapter, AdapterId, AdapterRegistry};
pub use channel::{Channel, ChannelTransportProperties, ConnectionType, Reliability, Resolver, TransportFactory};
pub use error::{ChannelError, ChannelResult};
pub use selection::ChannelSelectionStream;
