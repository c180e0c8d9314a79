//! Behavior pipeline
//!
//! Behaviors wrap the terminal handler as concentric layers: registration
//! order is outermost-first, so the first registered behavior sees the
//! message first and the result last. A behavior may short-circuit with its
//! own result, transform the outcome of `next`, or re-invoke `next` (retry).

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use cv_domain::{CvResult, MediatorError};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::context::DispatchContext;

/// Whether a dispatch is a request (single handler, typed response) or an
/// event (fan-out, unit response).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Event,
}

/// Type-erased response travelling back up the pipeline.
pub type BehaviorResponse = Box<dyn Any + Send>;

/// Type-erased view of the in-flight message, shared by every layer.
#[derive(Clone)]
pub struct BehaviorMessage {
    pub message_name: &'static str,
    pub kind: MessageKind,
    pub ctx: DispatchContext,
    payload: Arc<dyn Any + Send + Sync>,
}

impl BehaviorMessage {
    pub fn new(
        message_name: &'static str,
        kind: MessageKind,
        ctx: DispatchContext,
        payload: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            message_name,
            kind,
            ctx,
            payload,
        }
    }

    /// Typed access for behaviors that care about a specific message type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }
}

/// Innermost layer: invokes the actual handler.
pub type TerminalHandler =
    dyn Fn(&BehaviorMessage) -> BoxFuture<'static, CvResult<BehaviorResponse>> + Send + Sync;

/// Continuation into the remaining pipeline. Copyable so a behavior can
/// invoke it more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Behavior>],
    terminal: &'a TerminalHandler,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Behavior>], terminal: &'a TerminalHandler) -> Self {
        Self { chain, terminal }
    }

    /// Run the rest of the pipeline for `message`.
    pub fn run(self, message: &'a BehaviorMessage) -> BoxFuture<'a, CvResult<BehaviorResponse>> {
        match self.chain.split_first() {
            None => (self.terminal)(message),
            Some((head, rest)) => head.handle(
                message,
                Next {
                    chain: rest,
                    terminal: self.terminal,
                },
            ),
        }
    }
}

/// One pipeline layer.
pub trait Behavior: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        message: &'a BehaviorMessage,
        next: Next<'a>,
    ) -> BoxFuture<'a, CvResult<BehaviorResponse>>;
}

/// Run a handler future, lifting panics into `Fatal`.
///
/// This is the boundary that keeps unwinding from crossing the mediator API.
pub async fn catch_handler_panics<F>(future: F) -> CvResult<BehaviorResponse>
where
    F: std::future::Future<Output = CvResult<BehaviorResponse>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(MediatorError::fatal(format!(
            "handler panicked: {}",
            panic_message(&panic)
        ))),
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Behavior that records entry and exit order.
    struct Tracer {
        label: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Behavior for Tracer {
        fn handle<'a>(
            &'a self,
            message: &'a BehaviorMessage,
            next: Next<'a>,
        ) -> BoxFuture<'a, CvResult<BehaviorResponse>> {
            Box::pin(async move {
                self.trace.lock().unwrap().push(format!("{}:pre", self.label));
                let result = next.run(message).await;
                self.trace.lock().unwrap().push(format!("{}:post", self.label));
                result
            })
        }
    }

    fn message() -> BehaviorMessage {
        BehaviorMessage::new(
            "TestRequest",
            MessageKind::Request,
            DispatchContext::new(),
            Arc::new(42_u32),
        )
    }

    #[tokio::test]
    async fn behaviors_run_outermost_first_and_unwind_in_reverse() {
        let trace: Arc<Mutex<Vec<String>>> = Arc::default();
        let chain: Vec<Arc<dyn Behavior>> = vec![
            Arc::new(Tracer {
                label: "outer",
                trace: Arc::clone(&trace),
            }),
            Arc::new(Tracer {
                label: "inner",
                trace: Arc::clone(&trace),
            }),
        ];
        let inner_trace = Arc::clone(&trace);
        let terminal: Box<TerminalHandler> = Box::new(move |_message| {
            let trace = Arc::clone(&inner_trace);
            Box::pin(async move {
                trace.lock().unwrap().push("handler".to_string());
                Ok(Box::new(()) as BehaviorResponse)
            })
        });

        let msg = message();
        Next::new(&chain, &*terminal).run(&msg).await.unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["outer:pre", "inner:pre", "handler", "inner:post", "outer:post"]
        );
    }

    #[tokio::test]
    async fn panic_becomes_fatal_failure() {
        let result = catch_handler_panics(async {
            panic!("boom");
            #[allow(unreachable_code)]
            Ok(Box::new(()) as BehaviorResponse)
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, cv_domain::ErrorKind::Fatal);
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn downcast_sees_the_typed_payload() {
        let msg = message();
        assert_eq!(msg.downcast_ref::<u32>(), Some(&42));
        assert!(msg.downcast_ref::<String>().is_none());
    }
}
