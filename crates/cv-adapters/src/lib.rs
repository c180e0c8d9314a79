//! Convoy Adapter Implementations
//!
//! This crate provides adapter implementations for the ports defined in
//! cv-ports:
//! - In-memory reference stores (event store with live subscriptions,
//!   snapshots, checkpoints, flow snapshots, outbox, inbox, dead letters,
//!   idempotency)
//! - PostgreSQL event store with a transactional outbox
//! - Projection runtime with checkpointing and rebuild
//! - Outbox processor loop with backoff and dead-lettering
//! - Coordination primitives (lock, leader election, rate limiter) and
//!   cluster coordinators
//! - JSON serializer

pub mod config;
pub mod coordination;
pub mod memory;
pub mod outbox_processor;
pub mod postgres;
pub mod projections;
pub mod repository;
pub mod serializer;
pub mod unit_of_work;

pub use config::*;
pub use coordination::{
    default_node_id, LeaseClusterCoordinator, MemoryLeaderElection, MemoryLock, MemoryLockGuard,
    MemoryRateLimiter, StaticClusterCoordinator,
};
pub use memory::{
    ManualClock, MemoryCheckpointStore, MemoryDeadLetterStore, MemoryEventStore, MemoryFlowStore,
    MemoryIdempotencyStore, MemoryInboxStore, MemoryOutboxStore, MemorySnapshotStore,
};
pub use outbox_processor::{OutboxDispatcher, OutboxProcessor, OutboxProcessorConfig};
pub use postgres::{PostgresEventStore, PostgresOutboxStore};
pub use projections::{ProjectionError, ProjectionRuntime, ProjectionRuntimeConfig};
pub use repository::AggregateRepository;
pub use serializer::JsonSerializer;
pub use unit_of_work::append_with_outbox;
