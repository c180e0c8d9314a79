//! Convoy Port Traits
//!
//! This crate defines the port interfaces (traits) that adapters must
//! implement:
//! - EventStore / EventSubscriber
//! - SnapshotStore / CheckpointStore
//! - FlowStore
//! - OutboxStore / InboxStore / DeadLetterStore / IdempotencyStore
//! - DistributedLock / LeaderElection / RateLimiter
//! - ClusterCoordinator
//! - Serializer
//! - Clock
//!
//! Every port carries its own error enum; adapter errors convert into the
//! mediator taxonomy at the crate seam.

pub mod cancellation;
pub mod clock;
pub mod coordination;
pub mod event_store;
pub mod flow_store;
pub mod projection;
pub mod reliability;
pub mod serializer;
pub mod snapshot_store;

pub use cancellation::*;
pub use clock::*;
pub use coordination::*;
pub use event_store::*;
pub use flow_store::*;
pub use projection::*;
pub use reliability::*;
pub use serializer::*;
pub use snapshot_store::*;
