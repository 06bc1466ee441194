//! Per-identity client runtime: the server-connection manager (C9), the P2P
//! message stream manager (C10), and the registration / root-server
//! selection interface (C11) — `spec.md` §2, §4.7-§4.9.

pub mod error;
pub mod p2p;
pub mod registration;
pub mod server;

pub use error::{ClientError, ClientResult};
pub use p2p::{ClientMessageStreamManager, P2pStream};
pub use registration::{RegistrationOutcome, RegistrationRequest, RootServerClient, SignatureProvider, register};
pub use server::{ChannelProvider, ClientServerConnection, RequestPolicy, ServerConnectionManager, ServerConnectionManagerConfig};
