//! Cooperative cancellation signal
//!
//! The ambient token propagates mediator -> behaviors -> handler -> store and
//! into flow branches. Cancelling a parent cancels every descendant; a child
//! cancels independently of its parent.

use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative cancellation token.
///
/// Cheap to clone; clones observe the same signal. `child` derives a token
/// that also observes every ancestor.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    own: Arc<watch::Sender<bool>>,
    ancestors: Vec<watch::Receiver<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            own: Arc::new(tx),
            ancestors: Vec::new(),
        }
    }

    /// Derive a token cancelled by this one but able to cancel on its own.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.own.subscribe());
        Self {
            own: Arc::new(tx),
            ancestors,
        }
    }

    /// Signal cancellation to this token and every descendant.
    pub fn cancel(&self) {
        self.own.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.own.borrow() || self.ancestors.iter().any(|rx| *rx.borrow())
    }

    /// Resolve once this token or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut own_rx = self.own.subscribe();
        let mut ancestors = self.ancestors.clone();
        loop {
            {
                type ChangedFuture<'a> = std::pin::Pin<
                    Box<
                        dyn std::future::Future<Output = Result<(), watch::error::RecvError>>
                            + Send
                            + 'a,
                    >,
                >;
                let mut waiters: Vec<ChangedFuture<'_>> = Vec::with_capacity(ancestors.len() + 1);
                for rx in ancestors.iter_mut() {
                    waiters.push(Box::pin(rx.changed()));
                }
                waiters.push(Box::pin(own_rx.changed()));
                // A closed channel also wakes us; the flag check below decides.
                let _ = futures::future::select_all(waiters).await;
            }
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
