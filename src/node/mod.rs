pub mod broker;
pub mod engine;
pub mod net;
pub mod queue;
pub mod registry;
pub mod scheme;

pub use broker::BrokerHandle;
pub use engine::{Engine, EngineEvent, EngineMessage, ProtocolEngine};
pub use queue::{MemoryPool, PayloadQueue, QueueSignal};
pub use registry::{Node, NodeOptions};
pub use scheme::Scheme;
