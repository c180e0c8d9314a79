//! Validation behavior

use std::marker::PhantomData;

use cv_domain::{CvResult, MediatorError};
use futures::future::BoxFuture;

use crate::pipeline::{Behavior, BehaviorMessage, BehaviorResponse, Next};

/// Input predicate a message type can enforce before its handler runs.
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

/// Rejects invalid messages of type `M` ahead of the handler.
///
/// Scoped: register with `register_behavior_for::<M>` so the downcast always
/// matches.
pub struct ValidationBehavior<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> ValidationBehavior<M> {
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> Default for ValidationBehavior<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Behavior for ValidationBehavior<M>
where
    M: Validate + Send + Sync + 'static,
{
    fn handle<'a>(
        &'a self,
        message: &'a BehaviorMessage,
        next: Next<'a>,
    ) -> BoxFuture<'a, CvResult<BehaviorResponse>> {
        Box::pin(async move {
            if let Some(typed) = message.downcast_ref::<M>() {
                if let Err(reason) = typed.validate() {
                    return Err(MediatorError::validation(reason));
                }
            }
            next.run(message).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DispatchContext;
    use crate::pipeline::{MessageKind, TerminalHandler};
    use cv_domain::ErrorKind;
    use std::sync::Arc;

    struct Deposit {
        amount: i64,
    }

    impl Validate for Deposit {
        fn validate(&self) -> Result<(), String> {
            if self.amount <= 0 {
                return Err(format!("amount must be positive, got {}", self.amount));
            }
            Ok(())
        }
    }

    fn ok_terminal() -> Box<TerminalHandler> {
        Box::new(|_| Box::pin(async { Ok(Box::new(()) as BehaviorResponse) }))
    }

    fn message(amount: i64) -> BehaviorMessage {
        BehaviorMessage::new(
            "DepositCommand",
            MessageKind::Request,
            DispatchContext::new(),
            Arc::new(Deposit { amount }),
        )
    }

    #[tokio::test]
    async fn invalid_input_short_circuits() {
        let behavior = ValidationBehavior::<Deposit>::new();
        let terminal = ok_terminal();
        let chain: Vec<Arc<dyn Behavior>> = vec![];

        let msg = message(-5);
        let err = behavior
            .handle(&msg, Next::new(&chain, &*terminal))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.contains("-5"));

        let msg = message(10);
        behavior
            .handle(&msg, Next::new(&chain, &*terminal))
            .await
            .unwrap();
    }
}
