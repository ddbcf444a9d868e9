//! Work lifecycle events and the publish/subscribe plumbing that carries them.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::{WorkEvent, WorkEventKind};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
