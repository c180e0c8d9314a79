//! Flow snapshot persistence port

use std::future::Future;

use cv_domain::{ErrorKind, FlowSnapshot, MediatorError};

/// Flow store errors
#[derive(Debug, thiserror::Error)]
pub enum FlowStoreError {
    #[error("flow not found: {flow_id}")]
    FlowNotFound { flow_id: String },

    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl From<FlowStoreError> for MediatorError {
    fn from(e: FlowStoreError) -> Self {
        let kind = match &e {
            FlowStoreError::FlowNotFound { .. } => ErrorKind::NotFound,
            FlowStoreError::StorageUnavailable { .. } => ErrorKind::Transient,
            FlowStoreError::SerializationError { .. } => ErrorKind::Fatal,
        };
        MediatorError::new(kind, e.to_string())
    }
}

/// Durable flow position and state.
///
/// The engine is the single writer per flow id; the store only has to make
/// each `save` atomic, not merge concurrent writers.
pub trait FlowStore: Send + Sync {
    fn save(
        &self,
        snapshot: FlowSnapshot,
    ) -> impl Future<Output = Result<(), FlowStoreError>> + Send;

    fn load(
        &self,
        flow_id: &str,
    ) -> impl Future<Output = Result<Option<FlowSnapshot>, FlowStoreError>> + Send;

    fn delete(&self, flow_id: &str) -> impl Future<Output = Result<(), FlowStoreError>> + Send;
}
