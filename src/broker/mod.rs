pub mod channel;
pub mod engine;
pub mod id;
pub mod inflight;
pub mod message;
pub mod queue;
pub mod topic;

pub use channel::{Channel, ChannelStats, SweepOutcome};
pub use engine::Broker;
pub use id::MessageId;
pub use message::Message;
pub use topic::{Topic, TopicStats};
