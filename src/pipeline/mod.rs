pub mod publish;
pub mod pump;
pub mod session;

pub use publish::{ChannelPublisher, EncodedFrame, PublishedFrame, Publisher, ShutdownHandle};
pub use pump::{FramePump, Iteration, PumpOptions, StopReason};
pub use session::{PumpState, RunSummary, Session, SessionSettings};
