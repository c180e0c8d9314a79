//! Leader-gating behaviors

use std::marker::PhantomData;
use std::sync::Arc;

use cv_domain::{CvResult, MediatorError, Request};
use cv_ports::ClusterCoordinator;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::pipeline::{Behavior, BehaviorMessage, BehaviorResponse, Next};

/// Rejects dispatch on non-leader nodes.
///
/// The failure names the current leader's endpoint so the caller can redirect.
pub struct LeaderOnlyBehavior<C> {
    coordinator: Arc<C>,
}

impl<C> LeaderOnlyBehavior<C> {
    pub fn new(coordinator: Arc<C>) -> Self {
        Self { coordinator }
    }
}

impl<C> Behavior for LeaderOnlyBehavior<C>
where
    C: ClusterCoordinator + 'static,
{
    fn handle<'a>(
        &'a self,
        message: &'a BehaviorMessage,
        next: Next<'a>,
    ) -> BoxFuture<'a, CvResult<BehaviorResponse>> {
        Box::pin(async move {
            if self.coordinator.is_leader().await {
                return next.run(message).await;
            }
            let endpoint = self.coordinator.leader_endpoint().await;
            debug!(
                message = message.message_name,
                leader = endpoint.as_deref().unwrap_or("unknown"),
                "rejecting dispatch on non-leader node"
            );
            Err(MediatorError::not_leader(endpoint.as_deref()))
        })
    }
}

/// Proxies non-leader dispatches of request type `R` to the leader.
///
/// On the leader the pipeline continues locally; elsewhere the request is
/// serialized and handed to the cluster transport, and the typed response is
/// decoded from the reply. Scoped: register with `register_behavior_for::<R>`.
pub struct ForwardToLeaderBehavior<R, C> {
    coordinator: Arc<C>,
    _request: PhantomData<fn() -> R>,
}

impl<R, C> ForwardToLeaderBehavior<R, C> {
    pub fn new(coordinator: Arc<C>) -> Self {
        Self {
            coordinator,
            _request: PhantomData,
        }
    }
}

impl<R, C> Behavior for ForwardToLeaderBehavior<R, C>
where
    R: Request + Serialize,
    R::Response: DeserializeOwned,
    C: ClusterCoordinator + 'static,
{
    fn handle<'a>(
        &'a self,
        message: &'a BehaviorMessage,
        next: Next<'a>,
    ) -> BoxFuture<'a, CvResult<BehaviorResponse>> {
        Box::pin(async move {
            if self.coordinator.is_leader().await {
                return next.run(message).await;
            }

            let Some(request) = message.downcast_ref::<R>() else {
                return next.run(message).await;
            };
            let payload = serde_json::to_vec(request).map_err(|e| {
                MediatorError::fatal(format!("unencodable forwarded request: {e}"))
            })?;

            debug!(
                message = message.message_name,
                "forwarding dispatch to the leader"
            );
            let reply = self.coordinator.forward(R::name(), payload).await?;
            let response: R::Response = serde_json::from_slice(&reply).map_err(|e| {
                MediatorError::fatal(format!("undecodable forwarded response: {e}"))
            })?;
            Ok(Box::new(response) as BehaviorResponse)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DispatchContext;
    use crate::pipeline::{MessageKind, TerminalHandler};
    use cv_domain::{ErrorKind, Message};
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct WhoAmI;

    impl Message for WhoAmI {
        fn name() -> &'static str {
            "WhoAmI"
        }
    }

    impl Request for WhoAmI {
        type Response = String;
    }

    /// Minimal coordinator double for behavior tests.
    struct FixedCoordinator {
        node_id: String,
        leader: bool,
        endpoint: Option<String>,
    }

    impl ClusterCoordinator for FixedCoordinator {
        fn node_id(&self) -> &str {
            &self.node_id
        }

        async fn is_leader(&self) -> bool {
            self.leader
        }

        async fn leader_endpoint(&self) -> Option<String> {
            self.endpoint.clone()
        }

        async fn execute_if_leader<F, Fut, T>(&self, work: F) -> CvResult<T>
        where
            F: FnOnce() -> Fut + Send,
            Fut: std::future::Future<Output = CvResult<T>> + Send,
            T: Send,
        {
            if self.leader {
                work().await
            } else {
                Err(MediatorError::not_leader(self.endpoint.as_deref()))
            }
        }

        async fn forward(&self, _message_type: &str, _payload: Vec<u8>) -> CvResult<Vec<u8>> {
            Ok(serde_json::to_vec("leader-answer").unwrap())
        }
    }

    fn local_terminal() -> Box<TerminalHandler> {
        Box::new(|_| {
            Box::pin(async { Ok(Box::new("local-answer".to_string()) as BehaviorResponse) })
        })
    }

    fn message() -> BehaviorMessage {
        BehaviorMessage::new(
            "WhoAmI",
            MessageKind::Request,
            DispatchContext::new(),
            Arc::new(WhoAmI),
        )
    }

    #[tokio::test]
    async fn leader_only_rejects_followers_with_the_leader_endpoint() {
        let behavior = LeaderOnlyBehavior::new(Arc::new(FixedCoordinator {
            node_id: "b".into(),
            leader: false,
            endpoint: Some("a:7400".into()),
        }));
        let terminal = local_terminal();
        let chain: Vec<Arc<dyn Behavior>> = vec![];

        let msg = message();
        let err = behavior
            .handle(&msg, Next::new(&chain, &*terminal))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotLeader);
        assert!(err.message.contains("a:7400"));
    }

    #[tokio::test]
    async fn leader_only_passes_through_on_the_leader() {
        let behavior = LeaderOnlyBehavior::new(Arc::new(FixedCoordinator {
            node_id: "a".into(),
            leader: true,
            endpoint: None,
        }));
        let terminal = local_terminal();
        let chain: Vec<Arc<dyn Behavior>> = vec![];

        let msg = message();
        let response = behavior
            .handle(&msg, Next::new(&chain, &*terminal))
            .await
            .unwrap();
        assert_eq!(*response.downcast::<String>().unwrap(), "local-answer");
    }

    #[tokio::test]
    async fn forward_proxies_follower_dispatches() {
        let behavior = ForwardToLeaderBehavior::<WhoAmI, _>::new(Arc::new(FixedCoordinator {
            node_id: "b".into(),
            leader: false,
            endpoint: Some("a:7400".into()),
        }));
        let terminal = local_terminal();
        let chain: Vec<Arc<dyn Behavior>> = vec![];

        let msg = message();
        let response = behavior
            .handle(&msg, Next::new(&chain, &*terminal))
            .await
            .unwrap();
        assert_eq!(*response.downcast::<String>().unwrap(), "leader-answer");
    }

    #[tokio::test]
    async fn forward_runs_locally_on_the_leader() {
        let behavior = ForwardToLeaderBehavior::<WhoAmI, _>::new(Arc::new(FixedCoordinator {
            node_id: "a".into(),
            leader: true,
            endpoint: None,
        }));
        let terminal = local_terminal();
        let chain: Vec<Arc<dyn Behavior>> = vec![];

        let msg = message();
        let response = behavior
            .handle(&msg, Next::new(&chain, &*terminal))
            .await
            .unwrap();
        assert_eq!(*response.downcast::<String>().unwrap(), "local-answer");
    }
}
