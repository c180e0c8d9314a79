//! Convoy Mediator
//!
//! In-process dispatch hub: requests route to exactly one handler, events
//! fan out to every registered handler, and both pass through an ordered
//! behavior pipeline. All outcomes are typed results; nothing panics across
//! the mediator boundary.

pub mod behaviors;
pub mod context;
pub mod handler;
pub mod mediator;
pub mod pipeline;
pub mod registry;

pub use context::DispatchContext;
pub use handler::{EventHandler, RequestHandler};
pub use mediator::Mediator;
pub use pipeline::{Behavior, BehaviorMessage, BehaviorResponse, MessageKind, Next};
pub use registry::RegistryBuilder;
