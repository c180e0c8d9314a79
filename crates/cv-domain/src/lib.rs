//! Convoy Domain Core
//!
//! This crate contains the pure domain vocabulary for Convoy, including:
//! - Message identity and the request/event traits
//! - The result taxonomy shared by every public entrypoint
//! - Event envelopes, streams, and snapshots
//! - Reliability records (outbox, inbox, dead letters)
//! - Flow state, status transitions, and durable positions
//!
//! This crate MUST NOT import DB clients, transport frameworks, or runtime
//! primitives; everything here is plain data and pure functions.

pub mod aggregate;
pub mod envelope;
pub mod error;
pub mod flow;
pub mod message;
pub mod reliability;
pub mod snapshot;

pub use aggregate::*;
pub use envelope::*;
pub use error::*;
pub use flow::*;
pub use message::*;
pub use reliability::*;
pub use snapshot::*;
