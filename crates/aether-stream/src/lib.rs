//! Stream composition gates (C6) and the safe-stream reliability layer (C7)
//! that sit above a raw [`aether_core::stream::ByteStream`] (`spec.md` §2,
//! §4.2, §4.5).

pub mod error;
pub mod gate;
pub mod safe;

pub use error::{StreamError, StreamResult};
pub use gate::{AddHeaderGate, BufferStream, CryptoGate, KeyProvider, SerializeGate, SizedPacketGate, StaticKeyProvider};
pub use safe::{SafeStream, SafeStreamConfig};
