//! Handler traits

use std::future::Future;

use cv_domain::{CvResult, Event, Request};

use crate::context::DispatchContext;

/// Handles one request type. At most one handler per type is registered.
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    fn handle(
        &self,
        request: R,
        ctx: &DispatchContext,
    ) -> impl Future<Output = CvResult<R::Response>> + Send;
}

/// Handles one event type. Any number of handlers may register for a type;
/// each is invoked once per publish.
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    fn handle(
        &self,
        event: E,
        ctx: &DispatchContext,
    ) -> impl Future<Output = CvResult<()>> + Send;

    /// Name used in aggregated failure breakdowns.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
