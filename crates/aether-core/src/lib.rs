pub mod action;
pub mod error;
pub mod event;
pub mod log;
pub mod stats;
pub mod stream;
pub mod types;
pub mod wire;

pub use action::{Action, ActionPtr, OwnActionPtr, Scheduler, UpdateStatus};
pub use error::{CoreError, CoreResult};
pub use event::{EventSource, Subscription};
pub use stats::StatisticsCounter;
pub use stream::{ByteStream, LinkState, StreamInfo};
