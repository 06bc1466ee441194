//! C4 transport drivers: concrete [`aether_core::stream::ByteStream`]
//! implementations for the physical links a channel can be built over
//! (`spec.md` §4.3). Socket-backed drivers (TCP, UDP) own a tokio task
//! directly; packet-pipe drivers (modem, LoRa) are generic over an injected
//! hardware driver trait and layer tiered-int framing on top via
//! [`framing::FrameCollector`].

pub mod error;
pub mod framing;
pub mod lora;
pub mod modem;
pub mod poller;
pub mod tcp;
pub mod udp;

pub use error::{TransportError, TransportResult};
pub use lora::{LORA_MAX_PACKET_SIZE, LoraDriver, LoraTransport};
pub use modem::{ConnectionIndex, MODEM_MAX_PACKET_SIZE, ModemDriver, ModemTransport};
pub use poller::{ChannelPoller, PollerEvent, PollerEventKind, PollerHandle};
pub use tcp::TcpTransport;
pub use udp::{MAX_DATAGRAM_SIZE, UdpTransport};
