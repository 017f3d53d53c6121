//! Durable event bus: store contract, task/notice operations, handler
//! registry and the supervised listener.

pub mod bus;
pub mod listener;
pub mod registry;
pub mod store;

pub use bus::EventBus;
pub use listener::{EventListener, ListenerConfig};
pub use registry::{EventHandler, HandlerRegistry};
pub use store::{EventStore, SignalSource, SignalSubscription, check_transition};
