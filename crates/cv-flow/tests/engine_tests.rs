//! Flow engine behavior tests against the in-memory flow store.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cv_adapters::MemoryFlowStore;
use cv_domain::{ChangeMask, CvResult, ErrorKind, FlowState, FlowStatus, MediatorError};
use cv_flow::{FlowBuilder, FlowContext, FlowEngine, ForEachPolicy};
use cv_mediator::behaviors::RetryPolicy;
use cv_ports::FlowStore;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Default)]
struct TestState {
    flow_id: String,
    log: Vec<String>,
    failures: Vec<String>,
    total: i64,
    route: String,
    items: Vec<i64>,
    #[serde(skip)]
    mask: ChangeMask,
}

impl TestState {
    fn new(flow_id: &str) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            ..Self::default()
        }
    }

    fn note(&mut self, entry: impl Into<String>) {
        self.log.push(entry.into());
        self.mask.mark("log");
    }
}

impl FlowState for TestState {
    fn flow_id(&self) -> &str {
        &self.flow_id
    }

    fn has_changes(&self) -> bool {
        self.mask.has_changes()
    }

    fn changed_fields(&self) -> Vec<String> {
        self.mask.changed_fields()
    }

    fn mark_changed(&mut self, field: &str) {
        self.mask.mark(field);
    }

    fn clear_changes(&mut self) {
        self.mask.clear();
    }
}

fn engine() -> (FlowEngine<MemoryFlowStore>, Arc<MemoryFlowStore>) {
    let store = Arc::new(MemoryFlowStore::new());
    (FlowEngine::new(Arc::clone(&store)), store)
}

/// Step body that appends an entry to the state log.
macro_rules! note_step {
    ($entry:literal) => {
        |state: &mut TestState, _ctx: &FlowContext| {
            async move {
                state.note($entry);
                Ok(())
            }
            .boxed()
        }
    };
}

#[tokio::test]
async fn linear_flow_runs_to_succeeded() {
    let (engine, store) = engine();
    let definition = FlowBuilder::new("linear")
        .step("one", note_step!("one"))
        .step("two", note_step!("two"))
        .step("three", note_step!("three"))
        .build();

    let snapshot = engine.run(&definition, TestState::new("flow_linear")).await.unwrap();

    assert_eq!(snapshot.status, FlowStatus::Succeeded);
    assert_eq!(snapshot.position.path(), &[3]);
    assert!(snapshot.last_error.is_none());

    let persisted = store.load("flow_linear").await.unwrap().unwrap();
    let state: TestState = serde_json::from_value(persisted.state).unwrap();
    assert_eq!(state.log, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn failed_flow_parks_and_resume_completes() {
    static HEALTHY: AtomicBool = AtomicBool::new(false);
    static S1_RUNS: AtomicU32 = AtomicU32::new(0);

    let (engine, store) = engine();
    let definition = FlowBuilder::new("resumable")
        .step("s1", |state: &mut TestState, _ctx: &FlowContext| {
            async move {
                S1_RUNS.fetch_add(1, Ordering::SeqCst);
                state.note("s1");
                Ok(())
            }
            .boxed()
        })
        .step("s2", |state: &mut TestState, _ctx: &FlowContext| {
            async move {
                if !HEALTHY.load(Ordering::SeqCst) {
                    return Err(MediatorError::transient("downstream offline"));
                }
                state.note("s2");
                Ok(())
            }
            .boxed()
        })
        .step("s3", note_step!("s3"))
        .step("s4", note_step!("s4"))
        .build();

    let snapshot = engine
        .run(&definition, TestState::new("flow_resume"))
        .await
        .unwrap();
    assert_eq!(snapshot.status, FlowStatus::Failed);
    assert_eq!(snapshot.position.path(), &[1]);
    assert_eq!(snapshot.completed_steps.len(), 1);
    assert_eq!(snapshot.last_error.as_ref().unwrap().kind, ErrorKind::Transient);

    // A parked flow stays parked until the condition is fixed.
    let again = engine
        .resume::<TestState>(&definition, "flow_resume")
        .await
        .unwrap();
    assert_eq!(again.status, FlowStatus::Failed);

    HEALTHY.store(true, Ordering::SeqCst);
    let finished = engine
        .resume::<TestState>(&definition, "flow_resume")
        .await
        .unwrap();
    assert_eq!(finished.status, FlowStatus::Succeeded);
    assert_eq!(S1_RUNS.load(Ordering::SeqCst), 1);

    let persisted = store.load("flow_resume").await.unwrap().unwrap();
    let state: TestState = serde_json::from_value(persisted.state).unwrap();
    assert_eq!(state.log, vec!["s1", "s2", "s3", "s4"]);
}

#[tokio::test]
async fn step_retry_recovers_within_one_tick() {
    static ATTEMPTS: AtomicU32 = AtomicU32::new(0);

    let (engine, _store) = engine();
    let definition = FlowBuilder::new("retrying")
        .step("flaky", |state: &mut TestState, _ctx: &FlowContext| {
            async move {
                if ATTEMPTS.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(MediatorError::transient("try again"));
                }
                state.note("flaky-ok");
                Ok(())
            }
            .boxed()
        })
        .retry(RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        })
        .build();

    let snapshot = engine
        .run(&definition, TestState::new("flow_retry"))
        .await
        .unwrap();
    assert_eq!(snapshot.status, FlowStatus::Succeeded);
    assert_eq!(ATTEMPTS.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn step_timeout_is_step_failure() {
    let (engine, _store) = engine();
    let definition = FlowBuilder::new("slow")
        .step("sleepy", |_state: &mut TestState, _ctx: &FlowContext| {
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
            .boxed()
        })
        .timeout(Duration::from_millis(20))
        .build();

    let snapshot = engine
        .run(&definition, TestState::new("flow_timeout"))
        .await
        .unwrap();
    assert_eq!(snapshot.status, FlowStatus::Failed);
    let error = snapshot.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::Transient);
    assert!(error.message.contains("timed out"));
}

#[tokio::test]
async fn conditional_descends_the_matching_branch() {
    let (engine, _store) = engine();
    let definition = FlowBuilder::new("routed")
        .step("init", |state: &mut TestState, _ctx: &FlowContext| {
            async move {
                state.route = "premium".to_string();
                state.mark_changed("route");
                Ok(())
            }
            .boxed()
        })
        .conditional("tier", |c| {
            c.when(|s: &TestState| s.route == "premium", |b| {
                b.step("premium-path", note_step!("premium"))
            })
            .when(|s: &TestState| s.route == "basic", |b| {
                b.step("basic-path", note_step!("basic"))
            })
            .otherwise(|b| b.step("fallback-path", note_step!("fallback")))
        })
        .build();

    let snapshot = engine
        .run(&definition, TestState::new("flow_cond"))
        .await
        .unwrap();
    assert_eq!(snapshot.status, FlowStatus::Succeeded);

    let state: TestState = serde_json::from_value(snapshot.state).unwrap();
    assert_eq!(state.log, vec!["premium"]);
}

#[tokio::test]
async fn switch_executes_exactly_one_case() {
    let (engine, _store) = engine();
    let definition = FlowBuilder::new("switched")
        .switch(
            "by-route",
            |s: &TestState| s.route.clone(),
            |c| {
                c.case("a", |b| b.step("case-a", note_step!("a")))
                    .case("b", |b| b.step("case-b", note_step!("b")))
                    .default(|b| b.step("case-default", note_step!("default")))
            },
        )
        .build();

    let mut state = TestState::new("flow_switch");
    state.route = "unknown".to_string();
    let snapshot = engine.run(&definition, state).await.unwrap();

    let state: TestState = serde_json::from_value(snapshot.state).unwrap();
    assert_eq!(state.log, vec!["default"]);
}

#[tokio::test]
async fn compensations_run_in_reverse_completion_order() {
    let (engine, _store) = engine();
    let definition = FlowBuilder::new("saga")
        .step("reserve", note_step!("reserve"))
        .compensate(|state: &mut TestState, _ctx: &FlowContext| {
            async move {
                state.note("undo-reserve");
                Ok(())
            }
            .boxed()
        })
        .step("charge", note_step!("charge"))
        .compensate(|state: &mut TestState, _ctx: &FlowContext| {
            async move {
                state.note("undo-charge");
                Ok(())
            }
            .boxed()
        })
        .step("ship", |_state: &mut TestState, _ctx: &FlowContext| {
            async move { Err(MediatorError::fatal("carrier rejected the parcel")) }.boxed()
        })
        .build();

    let snapshot = engine
        .run(&definition, TestState::new("flow_saga"))
        .await
        .unwrap();

    assert_eq!(snapshot.status, FlowStatus::Compensated);
    assert_eq!(snapshot.last_error.as_ref().unwrap().kind, ErrorKind::Fatal);

    let state: TestState = serde_json::from_value(snapshot.state).unwrap();
    assert_eq!(
        state.log,
        vec!["reserve", "charge", "undo-charge", "undo-reserve"]
    );
}

#[tokio::test]
async fn for_each_continue_on_failure_collects_and_completes() {
    let (engine, _store) = engine();
    let mut initial = TestState::new("flow_loop");
    initial.items = vec![1, 2, 3, 4, 5, 6];

    let definition = FlowBuilder::new("loopy")
        .for_each(
            "process-items",
            |s: &TestState| s.items.clone(),
            1,
            ForEachPolicy::ContinueOnFailure,
            |item: i64, _ctx: FlowContext| {
                async move {
                    if item % 2 == 0 {
                        Err(MediatorError::transient(format!("item {item} rejected")))
                    } else {
                        Ok(item * 10)
                    }
                }
                .boxed()
            },
            |state: &mut TestState, _index, outcome: CvResult<i64>| {
                if let Ok(value) = outcome {
                    state.total += value;
                    state.mark_changed("total");
                }
            },
        )
        .on_item_fail(|state, index, error| {
            state.failures.push(format!("{index}:{:?}", error.kind));
            state.mark_changed("failures");
        })
        .on_complete(|state| {
            state.note("loop-done");
        })
        .build();

    let snapshot = engine.run(&definition, initial).await.unwrap();
    assert_eq!(snapshot.status, FlowStatus::Succeeded);

    let state: TestState = serde_json::from_value(snapshot.state).unwrap();
    assert_eq!(state.total, 90);
    assert_eq!(state.failures.len(), 3);
    assert_eq!(state.log, vec!["loop-done"]);
}

#[tokio::test]
async fn for_each_over_empty_sequence_completes_and_fires_on_complete_once() {
    static COMPLETIONS: AtomicU32 = AtomicU32::new(0);

    let (engine, _store) = engine();
    let definition = FlowBuilder::new("empty-loop")
        .for_each(
            "nothing",
            |_s: &TestState| Vec::<i64>::new(),
            4,
            ForEachPolicy::StopOnFirstFailure,
            |item: i64, _ctx: FlowContext| async move { Ok(item) }.boxed(),
            |_state: &mut TestState, _index, _outcome: CvResult<i64>| {},
        )
        .on_complete(|_state| {
            COMPLETIONS.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    let snapshot = engine
        .run(&definition, TestState::new("flow_empty_loop"))
        .await
        .unwrap();
    assert_eq!(snapshot.status, FlowStatus::Succeeded);
    assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn for_each_runs_items_concurrently() {
    let (engine, _store) = engine();
    let mut initial = TestState::new("flow_parallel_loop");
    initial.items = (1..=40).collect();

    let definition = FlowBuilder::new("parallel-loop")
        .for_each(
            "sleepers",
            |s: &TestState| s.items.clone(),
            10,
            ForEachPolicy::ContinueOnFailure,
            |item: i64, _ctx: FlowContext| {
                async move {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    Ok(item)
                }
                .boxed()
            },
            |state: &mut TestState, _index, outcome: CvResult<i64>| {
                if outcome.is_ok() {
                    state.total += 1;
                    state.mark_changed("total");
                }
            },
        )
        .build();

    let started = Instant::now();
    let snapshot = engine.run(&definition, initial).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(snapshot.status, FlowStatus::Succeeded);
    let state: TestState = serde_json::from_value(snapshot.state).unwrap();
    assert_eq!(state.total, 40);
    // 40 items at 25ms with 10 in flight is 4 waves; sequential would be 1s.
    assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
}

#[tokio::test]
async fn stop_on_first_failure_keeps_loop_progress_for_resume() {
    static ITEM_RUNS: AtomicU32 = AtomicU32::new(0);
    static HEALTHY: AtomicBool = AtomicBool::new(false);

    let (engine, _store) = engine();
    let mut initial = TestState::new("flow_loop_resume");
    initial.items = vec![10, 20, 30];

    let definition = FlowBuilder::new("stopper")
        .for_each(
            "items",
            |s: &TestState| s.items.clone(),
            1,
            ForEachPolicy::StopOnFirstFailure,
            |item: i64, _ctx: FlowContext| {
                async move {
                    ITEM_RUNS.fetch_add(1, Ordering::SeqCst);
                    if item == 20 && !HEALTHY.load(Ordering::SeqCst) {
                        Err(MediatorError::transient("item 20 rejected"))
                    } else {
                        Ok(item)
                    }
                }
                .boxed()
            },
            |state: &mut TestState, _index, outcome: CvResult<i64>| {
                if let Ok(value) = outcome {
                    state.total += value;
                    state.mark_changed("total");
                }
            },
        )
        .build();

    let snapshot = engine.run(&definition, initial).await.unwrap();
    assert_eq!(snapshot.status, FlowStatus::Failed);
    assert!(snapshot.loop_progress.is_some());
    assert_eq!(snapshot.loop_progress.as_ref().unwrap().completed, vec![0]);

    HEALTHY.store(true, Ordering::SeqCst);
    let finished = engine
        .resume::<TestState>(&definition, "flow_loop_resume")
        .await
        .unwrap();
    assert_eq!(finished.status, FlowStatus::Succeeded);

    let state: TestState = serde_json::from_value(finished.state).unwrap();
    assert_eq!(state.total, 60);
    // Item 10 ran once; 20 ran twice (failure + retry after resume); 30 once.
    assert_eq!(ITEM_RUNS.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn when_all_merges_every_branch() {
    let (engine, _store) = engine();
    let definition = FlowBuilder::new("fanout")
        .when_all(
            "both",
            |g| {
                g.branch("left", |b| {
                    b.step("left-step", |state: &mut TestState, _ctx: &FlowContext| {
                        async move {
                            state.total += 5;
                            state.mark_changed("total");
                            Ok(())
                        }
                        .boxed()
                    })
                })
                .branch("right", |b| {
                    b.step("right-step", |state: &mut TestState, _ctx: &FlowContext| {
                        async move {
                            state.total += 7;
                            state.mark_changed("total");
                            Ok(())
                        }
                        .boxed()
                    })
                })
            },
            |state, branch_states| {
                state.total = branch_states.iter().map(|b| b.total).sum();
                state.mark_changed("total");
            },
        )
        .build();

    let snapshot = engine
        .run(&definition, TestState::new("flow_when_all"))
        .await
        .unwrap();
    assert_eq!(snapshot.status, FlowStatus::Succeeded);

    let state: TestState = serde_json::from_value(snapshot.state).unwrap();
    assert_eq!(state.total, 12);
}

#[tokio::test]
async fn when_all_reports_the_first_failed_branch() {
    let (engine, _store) = engine();
    let definition = FlowBuilder::new("fanout-fail")
        .when_all(
            "group",
            |g| {
                g.branch("doomed", |b| {
                    b.step("explode", |_state: &mut TestState, _ctx: &FlowContext| {
                        async move { Err(MediatorError::transient("branch down")) }.boxed()
                    })
                })
                .branch("slow", |b| {
                    b.step("nap", |_state: &mut TestState, _ctx: &FlowContext| {
                        async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(())
                        }
                        .boxed()
                    })
                })
            },
            |_state, _branches| {},
        )
        .build();

    let snapshot = engine
        .run(&definition, TestState::new("flow_when_all_fail"))
        .await
        .unwrap();
    assert_eq!(snapshot.status, FlowStatus::Failed);

    let error = snapshot.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::Transient);
    assert!(error.message.contains("doomed"));
    assert_eq!(error.root_cause().message, "branch down");
}

#[tokio::test]
async fn when_any_adopts_the_first_success_and_cancels_the_rest() {
    let (engine, _store) = engine();
    let definition = FlowBuilder::new("race")
        .when_any(
            "fastest",
            |g| {
                g.branch("fast", |b| {
                    b.step("quick", |state: &mut TestState, _ctx: &FlowContext| {
                        async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            state.route = "fast".to_string();
                            state.mark_changed("route");
                            Ok(())
                        }
                        .boxed()
                    })
                })
                .branch("slow", |b| {
                    b.step("laggy", |state: &mut TestState, ctx: &FlowContext| {
                        async move {
                            // Cooperative: wind down as soon as the race is
                            // decided.
                            tokio::select! {
                                _ = ctx.cancellation.cancelled() => {
                                    return Err(MediatorError::cancelled());
                                }
                                _ = tokio::time::sleep(Duration::from_millis(400)) => {}
                            }
                            state.route = "slow".to_string();
                            state.mark_changed("route");
                            Ok(())
                        }
                        .boxed()
                    })
                })
            },
            |state, winner, _index| {
                state.route = winner.route;
                state.mark_changed("route");
            },
        )
        .build();

    let started = Instant::now();
    let snapshot = engine
        .run(&definition, TestState::new("flow_when_any"))
        .await
        .unwrap();

    assert_eq!(snapshot.status, FlowStatus::Succeeded);
    let state: TestState = serde_json::from_value(snapshot.state).unwrap();
    assert_eq!(state.route, "fast");
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[tokio::test]
async fn when_any_fails_only_when_every_branch_fails() {
    let (engine, _store) = engine();
    let definition = FlowBuilder::new("race-fail")
        .when_any(
            "hopeless",
            |g| {
                g.branch("a", |b| {
                    b.step("a", |_s: &mut TestState, _c: &FlowContext| {
                        async move { Err(MediatorError::transient("a down")) }.boxed()
                    })
                })
                .branch("b", |b| {
                    b.step("b", |_s: &mut TestState, _c: &FlowContext| {
                        async move { Err(MediatorError::transient("b down")) }.boxed()
                    })
                })
            },
            |_state, _winner, _index| {},
        )
        .build();

    let snapshot = engine
        .run(&definition, TestState::new("flow_when_any_fail"))
        .await
        .unwrap();
    assert_eq!(snapshot.status, FlowStatus::Failed);
    assert!(snapshot
        .last_error
        .unwrap()
        .message
        .contains("all 2 branches"));
}

#[tokio::test]
async fn cancelled_flow_parks_with_cancelled_error() {
    let (engine, _store) = engine();
    let definition = FlowBuilder::new("cancellable")
        .step("never", note_step!("never"))
        .build();

    let cancel = cv_ports::CancellationToken::new();
    cancel.cancel();
    let snapshot = engine
        .run_with_cancellation(&definition, TestState::new("flow_cancel"), cancel)
        .await
        .unwrap();

    assert_eq!(snapshot.status, FlowStatus::Failed);
    assert_eq!(snapshot.last_error.unwrap().kind, ErrorKind::Cancelled);

    let state: TestState = serde_json::from_value(snapshot.state).unwrap();
    assert!(state.log.is_empty());
}

#[tokio::test]
async fn terminal_flows_do_not_re_execute() {
    static RUNS: AtomicU32 = AtomicU32::new(0);

    let (engine, _store) = engine();
    let definition = FlowBuilder::new("once")
        .step("only", |state: &mut TestState, _ctx: &FlowContext| {
            async move {
                RUNS.fetch_add(1, Ordering::SeqCst);
                state.note("only");
                Ok(())
            }
            .boxed()
        })
        .build();

    let first = engine.run(&definition, TestState::new("flow_once")).await.unwrap();
    assert_eq!(first.status, FlowStatus::Succeeded);

    let second = engine.run(&definition, TestState::new("flow_once")).await.unwrap();
    assert_eq!(second.status, FlowStatus::Succeeded);
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);
}
