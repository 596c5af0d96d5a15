//! Pipeline engine: runs a fixed, ordered chain of stages over one document.
//!
//! Each stage sees only the previous stage's output. A stage output is
//! appended to the document's log only after the stage succeeds, so a
//! failure leaves the log exactly as it was before the failing stage.
//! Per-stage and per-run deadlines are enforced here; per-call deadlines
//! belong to the invocation proxy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::config::{ConfigError, PipelineTimeouts};
use crate::status::{PipelineOutcome, StatusFeed, StatusRecord};
use crate::tool_client::ToolInvocationProxy;

use super::errors::{PipelineError, StageError, StageFailure, TimeoutScope};
use super::stage::{Stage, StageContext};
use super::types::{Document, Event, EventKind, Received};

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Assembles a [`PipelineEngine`], validating the stage chain.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    timeouts: PipelineTimeouts,
    tools: Option<ToolInvocationProxy>,
    feed: Option<StatusFeed>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn timeouts(mut self, timeouts: PipelineTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn tools(mut self, proxy: ToolInvocationProxy) -> Self {
        self.tools = Some(proxy);
        self
    }

    pub fn feed(mut self, feed: StatusFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Check the chain and build the engine.
    ///
    /// The first stage must take a `Received` event, each stage's output
    /// must be the next stage's input, and stage names must be unique.
    pub fn build(self) -> Result<PipelineEngine, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPipeline { reason };

        let first = self
            .stages
            .first()
            .ok_or_else(|| invalid("pipeline has no stages".into()))?;
        if first.input_kind() != EventKind::Received {
            return Err(invalid(format!(
                "first stage '{}' must take a received event, not {}",
                first.name(),
                first.input_kind()
            )));
        }

        for pair in self.stages.windows(2) {
            if pair[0].output_kind() != pair[1].input_kind() {
                return Err(invalid(format!(
                    "stage '{}' produces {} but '{}' expects {}",
                    pair[0].name(),
                    pair[0].output_kind(),
                    pair[1].name(),
                    pair[1].input_kind()
                )));
            }
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name()) {
                return Err(invalid(format!("duplicate stage name '{}'", stage.name())));
            }
        }

        Ok(PipelineEngine {
            stages: self.stages,
            timeouts: self.timeouts,
            tools: self.tools,
            feed: self.feed.unwrap_or_default(),
        })
    }
}

// ─── PipelineEngine ──────────────────────────────────────────────────────────

/// Runs stages strictly in order. Cheap to share behind an `Arc`.
pub struct PipelineEngine {
    stages: Vec<Arc<dyn Stage>>,
    timeouts: PipelineTimeouts,
    tools: Option<ToolInvocationProxy>,
    feed: StatusFeed,
}

impl PipelineEngine {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn feed(&self) -> &StatusFeed {
        &self.feed
    }

    /// Run the pipeline and return only the final event.
    pub async fn run(&self, input: Received) -> Result<Event, PipelineError> {
        let doc = self.run_document(input).await?;
        let document_id = doc.id().to_string();
        doc.into_final_event().ok_or_else(|| PipelineError {
            document_id,
            failure: StageFailure {
                stage: String::new(),
                cause: StageError::InvalidInput {
                    reason: "pipeline produced no events".into(),
                },
            },
            history: Vec::new(),
        })
    }

    /// Run the pipeline and return the document with its full event log.
    pub async fn run_document(&self, input: Received) -> Result<Document, PipelineError> {
        let start = Instant::now();
        let mut doc = Document::from_received(&input);
        let document_id = doc.id().to_string();
        let ctx = StageContext::new(document_id.clone(), self.tools.clone());
        let mut current_stage = String::new();

        let run_timeout = self.timeouts.run_timeout();
        let outcome = tokio::time::timeout(
            run_timeout,
            self.run_stages(&mut doc, Event::Received(input), &ctx, &mut current_stage),
        )
        .await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(StageFailure {
                stage: current_stage,
                cause: StageError::Timeout {
                    scope: TimeoutScope::Run,
                    timeout_ms: run_timeout.as_millis() as u64,
                },
            }),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                tracing::info!(document_id = %document_id, elapsed_ms, "pipeline completed");
                self.feed.publish(StatusRecord::Pipeline {
                    document_id,
                    outcome: PipelineOutcome::Completed,
                    failed_stage: None,
                    elapsed_ms,
                    at: Utc::now(),
                });
                Ok(doc)
            }
            Err(failure) => {
                tracing::error!(
                    document_id = %document_id,
                    stage = %failure.stage,
                    error = %failure.cause,
                    elapsed_ms,
                    "pipeline failed"
                );
                self.feed.publish(StatusRecord::Pipeline {
                    document_id: document_id.clone(),
                    outcome: PipelineOutcome::Failed,
                    failed_stage: Some(failure.stage.clone()),
                    elapsed_ms,
                    at: Utc::now(),
                });
                Err(PipelineError {
                    document_id,
                    failure,
                    history: doc.into_events(),
                })
            }
        }
    }

    async fn run_stages(
        &self,
        doc: &mut Document,
        mut current: Event,
        ctx: &StageContext,
        current_stage: &mut String,
    ) -> Result<(), StageFailure> {
        let stage_timeout = self.timeouts.stage_timeout();

        for stage in &self.stages {
            let name = stage.name();
            current_stage.clear();
            current_stage.push_str(name);
            let fail = |cause: StageError| StageFailure {
                stage: name.to_string(),
                cause,
            };

            if current.kind() != stage.input_kind() {
                return Err(fail(StageError::UnexpectedEvent {
                    expected: stage.input_kind(),
                    actual: current.kind(),
                }));
            }

            let started = Instant::now();
            let output = tokio::time::timeout(stage_timeout, stage.handle(&current, ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(StageError::Timeout {
                        scope: TimeoutScope::Stage,
                        timeout_ms: stage_timeout.as_millis() as u64,
                    })
                })
                .map_err(fail)?;

            if output.kind() != stage.output_kind() {
                return Err(fail(StageError::UnexpectedEvent {
                    expected: stage.output_kind(),
                    actual: output.kind(),
                }));
            }

            tracing::info!(
                document_id = ctx.document_id(),
                stage = name,
                output = %output.kind(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stage completed"
            );
            doc.append(output.clone());
            current = output;
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::pipeline::types::{Assembled, Enhanced, Ingested, Metadata};

    fn ingested() -> Event {
        Event::Ingested(Ingested {
            title: "t".into(),
            content: "c".into(),
            content_size: 1,
            metadata: Metadata::new(),
            source_path: None,
        })
    }

    fn enhanced() -> Event {
        Event::Enhanced(Enhanced {
            title: "t".into(),
            content_size: 1,
            summary: "s".into(),
            key_points: Vec::new(),
            qa: Vec::new(),
            topics: Vec::new(),
            metadata: Metadata::new(),
        })
    }

    fn assembled() -> Event {
        Event::Assembled(Assembled {
            title: "t".into(),
            summary: "s".into(),
            qa_pairs: Vec::new(),
            highlights: Vec::new(),
            topics: Vec::new(),
            metadata: Metadata::new(),
        })
    }

    /// Records the kind of every input it sees and emits a fixed output.
    struct Recording {
        name: &'static str,
        input: EventKind,
        output_kind: EventKind,
        output: Event,
        seen: Arc<Mutex<Vec<EventKind>>>,
        delay: Duration,
        fail: bool,
    }

    impl Recording {
        fn new(name: &'static str, input: EventKind, output: Event) -> Self {
            Self {
                name,
                input,
                output_kind: output.kind(),
                output,
                seen: Arc::new(Mutex::new(Vec::new())),
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Stage for Recording {
        fn name(&self) -> &str {
            self.name
        }
        fn input_kind(&self) -> EventKind {
            self.input
        }
        fn output_kind(&self) -> EventKind {
            self.output_kind
        }
        async fn handle(&self, input: &Event, _ctx: &StageContext) -> Result<Event, StageError> {
            self.seen.lock().unwrap().push(input.kind());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(StageError::Collaborator {
                    reason: "boom".into(),
                });
            }
            Ok(self.output.clone())
        }
    }

    fn three_stages() -> (Recording, Recording, Recording) {
        (
            Recording::new("a", EventKind::Received, ingested()),
            Recording::new("b", EventKind::Ingested, enhanced()),
            Recording::new("c", EventKind::Enhanced, assembled()),
        )
    }

    #[tokio::test]
    async fn test_each_stage_sees_only_previous_output() {
        let (a, b, c) = three_stages();
        let (seen_b, seen_c) = (Arc::clone(&b.seen), Arc::clone(&c.seen));
        let engine = PipelineEngine::builder().stage(a).stage(b).stage(c).build().unwrap();

        let doc = engine.run_document(Received::new("body")).await.unwrap();
        assert_eq!(*seen_b.lock().unwrap(), vec![EventKind::Ingested]);
        assert_eq!(*seen_c.lock().unwrap(), vec![EventKind::Enhanced]);

        let kinds: Vec<EventKind> = doc.events().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Ingested, EventKind::Enhanced, EventKind::Assembled]
        );
    }

    #[tokio::test]
    async fn test_run_returns_final_event() {
        let (a, b, c) = three_stages();
        let engine = PipelineEngine::builder().stage(a).stage(b).stage(c).build().unwrap();
        let event = engine.run(Received::new("body")).await.unwrap();
        assert_eq!(event.kind(), EventKind::Assembled);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_stages() {
        let (a, mut b, c) = three_stages();
        b.fail = true;
        let seen_c = Arc::clone(&c.seen);
        let feed = StatusFeed::default();
        let mut rx = feed.subscribe();
        let engine = PipelineEngine::builder()
            .stage(a)
            .stage(b)
            .stage(c)
            .feed(feed)
            .build()
            .unwrap();

        let err = engine
            .run(Received::new("body").with_id("doc-9"))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "b");
        assert_eq!(err.document_id, "doc-9");
        assert_eq!(err.history.len(), 1);
        assert_eq!(err.history[0].kind(), EventKind::Ingested);
        assert!(seen_c.lock().unwrap().is_empty());

        match rx.recv().await.unwrap() {
            StatusRecord::Pipeline {
                outcome,
                failed_stage,
                ..
            } => {
                assert_eq!(outcome, PipelineOutcome::Failed);
                assert_eq!(failed_stage.as_deref(), Some("b"));
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stage_is_never_retried() {
        let (a, mut b, c) = three_stages();
        b.fail = true;
        let seen_b = Arc::clone(&b.seen);
        let engine = PipelineEngine::builder().stage(a).stage(b).stage(c).build().unwrap();
        assert!(engine.run(Received::new("body")).await.is_err());
        assert_eq!(seen_b.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_fails_only_that_stage() {
        let (a, mut b, c) = three_stages();
        b.delay = Duration::from_secs(10);
        let engine = PipelineEngine::builder()
            .stage(a)
            .stage(b)
            .stage(c)
            .timeouts(PipelineTimeouts {
                stage_timeout_ms: 1_000,
                run_timeout_ms: 60_000,
            })
            .build()
            .unwrap();

        let err = engine.run(Received::new("body")).await.unwrap_err();
        assert_eq!(err.stage(), "b");
        assert!(matches!(
            err.cause(),
            StageError::Timeout { scope: TimeoutScope::Stage, timeout_ms: 1_000 }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_names_running_stage() {
        let (mut a, mut b, c) = three_stages();
        a.delay = Duration::from_millis(600);
        b.delay = Duration::from_millis(600);
        let engine = PipelineEngine::builder()
            .stage(a)
            .stage(b)
            .stage(c)
            .timeouts(PipelineTimeouts {
                stage_timeout_ms: 1_000,
                run_timeout_ms: 1_000,
            })
            .build()
            .unwrap();

        let err = engine.run(Received::new("body")).await.unwrap_err();
        assert_eq!(err.stage(), "b");
        assert!(matches!(
            err.cause(),
            StageError::Timeout { scope: TimeoutScope::Run, .. }
        ));
        assert_eq!(err.history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_in_one_run_leaves_others_alone() {
        let slow = {
            let (a, mut b, c) = three_stages();
            b.delay = Duration::from_secs(10);
            PipelineEngine::builder()
                .stage(a)
                .stage(b)
                .stage(c)
                .timeouts(PipelineTimeouts {
                    stage_timeout_ms: 1_000,
                    run_timeout_ms: 60_000,
                })
                .build()
                .unwrap()
        };
        let fast = {
            let (a, mut b, c) = three_stages();
            b.delay = Duration::from_millis(500);
            PipelineEngine::builder().stage(a).stage(b).stage(c).build().unwrap()
        };

        let (slow_result, fast_result) = tokio::join!(
            slow.run(Received::new("slow")),
            fast.run(Received::new("fast"))
        );
        assert!(slow_result.is_err());
        assert!(fast_result.is_ok());
    }

    #[test]
    fn test_builder_rejects_broken_chain() {
        let (a, _, c) = three_stages();
        let err = PipelineEngine::builder().stage(a).stage(c).build().err().unwrap();
        assert!(matches!(err, ConfigError::InvalidPipeline { ref reason } if reason.contains("expects enhanced")));
    }

    #[test]
    fn test_builder_rejects_bad_first_stage() {
        let (_, b, _) = three_stages();
        assert!(PipelineEngine::builder().stage(b).build().is_err());
    }

    #[test]
    fn test_builder_rejects_empty_and_duplicates() {
        assert!(PipelineEngine::builder().build().is_err());

        let a1 = Recording::new("a", EventKind::Received, ingested());
        let a2 = Recording::new("a", EventKind::Ingested, enhanced());
        let err = PipelineEngine::builder().stage(a1).stage(a2).build().err().unwrap();
        assert!(err.to_string().contains("duplicate stage name 'a'"));
    }

    #[tokio::test]
    async fn test_wrong_output_kind_is_unexpected_event() {
        let a = Recording::new("a", EventKind::Received, ingested());
        let mut liar = Recording::new("b", EventKind::Ingested, enhanced());
        liar.output = assembled();
        let c = Recording::new("c", EventKind::Enhanced, assembled());
        let engine = PipelineEngine::builder().stage(a).stage(liar).stage(c).build().unwrap();

        let err = engine.run(Received::new("body")).await.unwrap_err();
        assert_eq!(err.stage(), "b");
        assert!(matches!(
            err.cause(),
            StageError::UnexpectedEvent {
                expected: EventKind::Enhanced,
                actual: EventKind::Assembled
            }
        ));
        assert_eq!(err.history.len(), 1);
        assert_eq!(engine.stage_names(), vec!["a", "b", "c"]);
    }
}
