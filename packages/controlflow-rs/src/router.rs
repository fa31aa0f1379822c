//! Typed content router.
//!
//! A [`RoutingPipeline`] forwards each envelope to the first [`Stage`] whose
//! matcher accepts it. Matching is by [`Routable::tag`] or by predicate;
//! envelopes nobody claims go to the pipeline's unmatched output, which is
//! either another destination (often another pipeline) or the dead-letter log.
//!
//! ```text
//! envelope ─► steps ─► stage 0 ─► stage 1 ─► ... ─► unmatched output
//!               │         │          │
//!            dropped      ▼          ▼
//!                       dest 0     dest 1
//! ```
//!
//! Tag matchers are resolved into a dispatch table when the pipeline is built,
//! so routing by tag is a hash lookup instead of a scan. Predicate stages are
//! only evaluated when they sit ahead of the tag hit, which keeps the result
//! identical to checking every stage in registration order.
//!
//! # Example
//!
//! ```ignore
//! use controlflow::{RoutingPipeline, Stage};
//!
//! let pipeline = RoutingPipeline::builder()
//!     .name("dispatcher")
//!     .stage(
//!         Stage::new("search", search_worker)
//!             .tag(SignalKind::ThingSearch)
//!             .tag(SignalKind::SudoThingSearch),
//!     )
//!     .stage(
//!         Stage::new("retrieve", aggregator)
//!             .tag(SignalKind::RetrieveThings)
//!             .tag(SignalKind::SudoRetrieveThings),
//!     )
//!     .dead_letter()
//!     .build()?;
//!
//! pipeline.route(Envelope::new(signal, reply_tx));
//! ```
//!
//! # Guarantees
//!
//! - Stage order is fixed at build time; the first match wins
//! - `route` is synchronous, never queues, and never waits on a destination
//! - The reply channel and correlation ID reach the destination untouched
//! - A built pipeline holds no mutable state and can be shared across tasks

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::destination::Destination;
use crate::envelope::{Envelope, Routable};
use crate::error::FlowError;

const DEFAULT_NAME: &str = "router";

type StepFn<M, R> = Box<dyn Fn(Envelope<M, R>) -> Option<Envelope<M, R>> + Send + Sync>;

// =============================================================================
// Stage
// =============================================================================

/// How a stage recognizes its envelopes.
pub enum Matcher<M: Routable> {
    /// Matches payloads with exactly this tag.
    Tag(M::Tag),
    /// Matches payloads the predicate accepts. Must be total and side-effect free.
    Predicate(Arc<dyn Fn(&M) -> bool + Send + Sync>),
}

impl<M: Routable> Clone for Matcher<M> {
    fn clone(&self) -> Self {
        match self {
            Matcher::Tag(tag) => Matcher::Tag(*tag),
            Matcher::Predicate(f) => Matcher::Predicate(f.clone()),
        }
    }
}

impl<M: Routable> fmt::Debug for Matcher<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Tag(tag) => f.debug_tuple("Tag").field(tag).finish(),
            Matcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// One match-and-forward rule: a destination plus what it accepts.
///
/// A stage with several matchers merges related kinds (e.g. a command and its
/// privileged variant) into one hand-off.
pub struct Stage<M: Routable, R> {
    name: String,
    destination: Arc<dyn Destination<M, R>>,
    // Two matchers (primary + sudo variant) is the common case
    matchers: SmallVec<[Matcher<M>; 2]>,
}

impl<M: Routable, R> Stage<M, R> {
    /// Create a stage forwarding to `destination`. Add matchers with
    /// [`tag`](Self::tag) or [`predicate`](Self::predicate).
    pub fn new(name: impl Into<String>, destination: impl Destination<M, R> + 'static) -> Self {
        Self::from_arc(name, Arc::new(destination))
    }

    /// Like [`new`](Self::new), for an already shared destination.
    pub fn from_arc(name: impl Into<String>, destination: Arc<dyn Destination<M, R>>) -> Self {
        Self {
            name: name.into(),
            destination,
            matchers: SmallVec::new(),
        }
    }

    /// Also accept payloads tagged `tag`.
    pub fn tag(mut self, tag: M::Tag) -> Self {
        self.matchers.push(Matcher::Tag(tag));
        self
    }

    /// Also accept payloads `predicate` returns true for.
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.matchers.push(Matcher::Predicate(Arc::new(predicate)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matchers(&self) -> &[Matcher<M>] {
        &self.matchers
    }

    fn has_predicate(&self) -> bool {
        self.matchers
            .iter()
            .any(|m| matches!(m, Matcher::Predicate(_)))
    }

    fn accepts_by_predicate(&self, payload: &M) -> bool {
        self.matchers.iter().any(|m| match m {
            Matcher::Predicate(f) => f(payload),
            Matcher::Tag(_) => false,
        })
    }
}

impl<M: Routable, R> fmt::Debug for Stage<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("matchers", &self.matchers)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Pre-routing steps
// =============================================================================

/// A transform applied to every envelope before stage matching.
///
/// Returning `None` drops the envelope (e.g. an enforcement step rejecting
/// a request).
pub struct Step<M, R> {
    name: String,
    f: StepFn<M, R>,
}

impl<M, R> Step<M, R> {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Envelope<M, R>) -> Option<Envelope<M, R>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// Routing outcome
// =============================================================================

/// What [`RoutingPipeline::route`] did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Handed to the destination of the stage at this index.
    Forwarded { stage: usize },
    /// No stage matched; handed to the unmatched output.
    Unmatched,
    /// No stage matched and there is no unmatched output; logged and dropped.
    DeadLettered,
    /// The pre-routing step at this index dropped it.
    Dropped { step: usize },
}

enum Fallback<M, R> {
    Forward(Arc<dyn Destination<M, R>>),
    DeadLetter,
}

// =============================================================================
// Routing Pipeline
// =============================================================================

/// An immutable, ordered set of stages with one unmatched output.
pub struct RoutingPipeline<M: Routable, R> {
    name: String,
    steps: Vec<Step<M, R>>,
    stages: Vec<Stage<M, R>>,
    /// Tag to the index of the first stage accepting it.
    by_tag: HashMap<M::Tag, usize>,
    /// Indices of stages with at least one predicate, ascending.
    predicate_stages: Vec<usize>,
    fallback: Fallback<M, R>,
}

impl<M: Routable, R> RoutingPipeline<M, R> {
    pub fn builder() -> RoutingPipelineBuilder<M, R> {
        RoutingPipelineBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stages in matching order.
    pub fn stages(&self) -> &[Stage<M, R>] {
        &self.stages
    }

    /// Name of the stage at `index`, as reported by [`Routed::Forwarded`].
    pub fn stage_name(&self, index: usize) -> Option<&str> {
        self.stages.get(index).map(|s| s.name())
    }

    /// Index of the stage that would receive `payload`, if any.
    ///
    /// Pre-routing steps are not applied.
    pub fn match_stage(&self, payload: &M) -> Option<usize> {
        let tag_hit = self.by_tag.get(&payload.tag()).copied();

        for &index in &self.predicate_stages {
            if tag_hit.is_some_and(|hit| index >= hit) {
                break;
            }
            if self.stages[index].accepts_by_predicate(payload) {
                return Some(index);
            }
        }

        tag_hit
    }

    /// Route one envelope.
    ///
    /// Runs the pre-routing steps, then hands the envelope to the first
    /// matching stage's destination, the unmatched output, or the dead-letter
    /// log. Never blocks and never fails.
    pub fn route(&self, envelope: Envelope<M, R>) -> Routed {
        let mut envelope = envelope;
        for (index, step) in self.steps.iter().enumerate() {
            let cid = envelope.cid;
            match (step.f)(envelope) {
                Some(next) => envelope = next,
                None => {
                    debug!(
                        router = %self.name,
                        step = %step.name,
                        cid = %cid,
                        "envelope dropped by pre-routing step"
                    );
                    return Routed::Dropped { step: index };
                }
            }
        }

        match self.match_stage(&envelope.payload) {
            Some(index) => {
                let stage = &self.stages[index];
                trace!(
                    router = %self.name,
                    stage = %stage.name,
                    tag = ?envelope.tag(),
                    cid = %envelope.cid,
                    "forwarding envelope"
                );
                stage.destination.tell(envelope);
                Routed::Forwarded { stage: index }
            }
            None => match &self.fallback {
                Fallback::Forward(next) => {
                    trace!(
                        router = %self.name,
                        tag = ?envelope.tag(),
                        cid = %envelope.cid,
                        "no stage matched, passing to unmatched output"
                    );
                    next.tell(envelope);
                    Routed::Unmatched
                }
                Fallback::DeadLetter => {
                    warn!(
                        router = %self.name,
                        tag = ?envelope.tag(),
                        cid = %envelope.cid,
                        "unhandled envelope dead-lettered"
                    );
                    Routed::DeadLettered
                }
            },
        }
    }

    /// Make `next` this pipeline's unmatched output.
    ///
    /// Replaces any unmatched output set at build time. Envelopes matched here
    /// never reach `next`.
    pub fn chain(mut self, next: RoutingPipeline<M, R>) -> Self
    where
        M: Send + 'static,
        R: Send + 'static,
    {
        debug!(router = %self.name, next = %next.name, "chaining pipelines");
        self.fallback = Fallback::Forward(Arc::new(next));
        self
    }
}

impl<M, R> Destination<M, R> for RoutingPipeline<M, R>
where
    M: Routable + Send,
    R: Send,
{
    fn tell(&self, envelope: Envelope<M, R>) {
        self.route(envelope);
    }
}

impl<M: Routable, R> fmt::Debug for RoutingPipeline<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("RoutingPipeline")
            .field("name", &self.name)
            .field("steps", &steps)
            .field("stages", &self.stages)
            .field(
                "dead_letter",
                &matches!(self.fallback, Fallback::DeadLetter),
            )
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`RoutingPipeline`].
pub struct RoutingPipelineBuilder<M: Routable, R> {
    name: String,
    steps: Vec<Step<M, R>>,
    stages: Vec<Stage<M, R>>,
    fallback: Fallback<M, R>,
}

impl<M: Routable, R> RoutingPipelineBuilder<M, R> {
    fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            steps: Vec::new(),
            stages: Vec::new(),
            fallback: Fallback::DeadLetter,
        }
    }

    /// Name used in log fields.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a pre-routing step. Steps run in the order added.
    pub fn step(mut self, step: Step<M, R>) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a stage. Earlier stages take precedence.
    pub fn stage(mut self, stage: Stage<M, R>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Send unmatched envelopes to `destination`.
    pub fn unmatched(mut self, destination: impl Destination<M, R> + 'static) -> Self {
        self.fallback = Fallback::Forward(Arc::new(destination));
        self
    }

    /// Log and drop unmatched envelopes. This is the default.
    pub fn dead_letter(mut self) -> Self {
        self.fallback = Fallback::DeadLetter;
        self
    }

    /// Resolve the dispatch table and freeze the pipeline.
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidConfig`] if a stage has no matcher.
    pub fn build(self) -> Result<RoutingPipeline<M, R>, FlowError> {
        let mut by_tag: HashMap<M::Tag, usize> = HashMap::new();
        let mut predicate_stages = Vec::new();

        for (index, stage) in self.stages.iter().enumerate() {
            if stage.matchers.is_empty() {
                return Err(FlowError::invalid(
                    "stage",
                    format!("stage `{}` has no matcher", stage.name),
                ));
            }
            for matcher in &stage.matchers {
                if let Matcher::Tag(tag) = matcher {
                    if let Some(&first) = by_tag.get(tag) {
                        debug!(
                            router = %self.name,
                            tag = ?tag,
                            shadowed = %stage.name,
                            by = %self.stages[first].name,
                            "tag already claimed by an earlier stage"
                        );
                    } else {
                        by_tag.insert(*tag, index);
                    }
                }
            }
            if stage.has_predicate() {
                predicate_stages.push(index);
            }
        }

        debug!(
            router = %self.name,
            stages = self.stages.len(),
            steps = self.steps.len(),
            tags = by_tag.len(),
            "routing pipeline built"
        );

        Ok(RoutingPipeline {
            name: self.name,
            steps: self.steps,
            stages: self.stages,
            by_tag,
            predicate_stages,
            fallback: self.fallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDestination;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        A,
        B,
        C,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Msg {
        kind: Kind,
        body: &'static str,
    }

    impl Routable for Msg {
        type Tag = Kind;

        fn tag(&self) -> Kind {
            self.kind
        }
    }

    fn msg(kind: Kind, body: &'static str) -> Msg {
        Msg { kind, body }
    }

    type Reply = mpsc::UnboundedSender<String>;

    // =========================================================================
    // Matching Tests
    // =========================================================================

    #[tokio::test]
    async fn test_tag_scenario_with_reply_channel() {
        let dest_x: RecordingDestination<Msg, Reply> = RecordingDestination::new();
        let dest_y = RecordingDestination::new();
        let unmatched = RecordingDestination::new();

        let pipeline = RoutingPipeline::builder()
            .stage(Stage::new("x", dest_x.clone()).tag(Kind::A))
            .stage(Stage::new("y", dest_y.clone()).tag(Kind::B))
            .unmatched(unmatched.clone())
            .build()
            .unwrap();

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        assert_eq!(
            pipeline.route(Envelope::new(msg(Kind::C, "c"), reply_tx.clone())),
            Routed::Unmatched
        );
        assert_eq!(
            pipeline.route(Envelope::new(msg(Kind::A, "a"), reply_tx)),
            Routed::Forwarded { stage: 0 }
        );

        assert!(dest_y.is_empty());
        assert_eq!(unmatched.take()[0].payload.body, "c");

        // The handler can answer the original sender directly
        let handled = dest_x.take().remove(0);
        assert_eq!(handled.payload, msg(Kind::A, "a"));
        handled.reply_to.send("done".to_string()).unwrap();
        assert_eq!(reply_rx.recv().await.unwrap(), "done");
    }

    #[test]
    fn test_one_stage_merges_two_tags() {
        let search: RecordingDestination<Msg, ()> = RecordingDestination::new();

        let pipeline = RoutingPipeline::builder()
            .stage(Stage::new("search", search.clone()).tag(Kind::A).tag(Kind::B))
            .build()
            .unwrap();

        pipeline.route(Envelope::new(msg(Kind::A, "1"), ()));
        pipeline.route(Envelope::new(msg(Kind::B, "2"), ()));
        assert_eq!(
            pipeline.route(Envelope::new(msg(Kind::C, "3"), ())),
            Routed::DeadLettered
        );

        let bodies: Vec<_> = search.take().into_iter().map(|e| e.payload.body).collect();
        assert_eq!(bodies, vec!["1", "2"]);
    }

    #[test]
    fn test_first_registered_tag_wins() {
        let first: RecordingDestination<Msg, ()> = RecordingDestination::new();
        let second = RecordingDestination::new();

        let pipeline = RoutingPipeline::builder()
            .stage(Stage::new("first", first.clone()).tag(Kind::A))
            .stage(Stage::new("second", second.clone()).tag(Kind::A).tag(Kind::B))
            .build()
            .unwrap();

        pipeline.route(Envelope::new(msg(Kind::A, "a"), ()));
        pipeline.route(Envelope::new(msg(Kind::B, "b"), ()));

        assert_eq!(first.len(), 1);
        assert_eq!(second.take()[0].payload.body, "b");
    }

    #[test]
    fn test_predicate_ahead_of_tag_hit_wins() {
        let urgent: RecordingDestination<Msg, ()> = RecordingDestination::new();
        let by_tag = RecordingDestination::new();

        let pipeline = RoutingPipeline::builder()
            .stage(Stage::new("urgent", urgent.clone()).predicate(|m: &Msg| m.body.starts_with('!')))
            .stage(Stage::new("by-tag", by_tag.clone()).tag(Kind::A))
            .build()
            .unwrap();

        assert_eq!(
            pipeline.route(Envelope::new(msg(Kind::A, "!now"), ())),
            Routed::Forwarded { stage: 0 }
        );
        assert_eq!(
            pipeline.route(Envelope::new(msg(Kind::A, "later"), ())),
            Routed::Forwarded { stage: 1 }
        );
        assert_eq!(urgent.len(), 1);
        assert_eq!(by_tag.len(), 1);
    }

    #[test]
    fn test_predicate_behind_tag_hit_is_skipped() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let by_tag: RecordingDestination<Msg, ()> = RecordingDestination::new();
        let catch_all = RecordingDestination::new();

        let pipeline = RoutingPipeline::builder()
            .stage(Stage::new("by-tag", by_tag.clone()).tag(Kind::A))
            .stage(Stage::new("catch-all", catch_all.clone()).predicate(move |_: &Msg| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                true
            }))
            .build()
            .unwrap();

        pipeline.route(Envelope::new(msg(Kind::A, "a"), ()));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        pipeline.route(Envelope::new(msg(Kind::C, "c"), ()));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(by_tag.len(), 1);
        assert_eq!(catch_all.len(), 1);
    }

    #[test]
    fn test_stage_without_matcher_is_rejected() {
        let dest: RecordingDestination<Msg, ()> = RecordingDestination::new();

        let err = RoutingPipeline::builder()
            .stage(Stage::new("nothing", dest))
            .build()
            .unwrap_err();

        assert!(err.is_config());
    }

    // =========================================================================
    // Composition Tests
    // =========================================================================

    #[test]
    fn test_chain_passes_unmatched_onward() {
        let x: RecordingDestination<Msg, ()> = RecordingDestination::new();
        let y = RecordingDestination::new();

        let first = RoutingPipeline::builder()
            .name("first")
            .stage(Stage::new("x", x.clone()).tag(Kind::A))
            .build()
            .unwrap();
        let second = RoutingPipeline::builder()
            .name("second")
            .stage(Stage::new("y", y.clone()).tag(Kind::B))
            .build()
            .unwrap();

        let chained = first.chain(second);

        assert_eq!(
            chained.route(Envelope::new(msg(Kind::A, "a"), ())),
            Routed::Forwarded { stage: 0 }
        );
        assert_eq!(
            chained.route(Envelope::new(msg(Kind::B, "b"), ())),
            Routed::Unmatched
        );
        assert_eq!(
            chained.route(Envelope::new(msg(Kind::C, "c"), ())),
            Routed::Unmatched
        );

        assert_eq!(x.len(), 1);
        assert_eq!(y.len(), 1);
    }

    #[test]
    fn test_pre_step_can_rewrite_and_drop() {
        let dest: RecordingDestination<Msg, ()> = RecordingDestination::new();

        let pipeline = RoutingPipeline::builder()
            .step(Step::new("reject-empty", |env: Envelope<Msg, ()>| {
                if env.payload.body.is_empty() {
                    None
                } else {
                    Some(env)
                }
            }))
            .step(Step::new("promote", |env: Envelope<Msg, ()>| {
                Some(env.map(|m| Msg { kind: Kind::A, ..m }))
            }))
            .stage(Stage::new("a", dest.clone()).tag(Kind::A))
            .build()
            .unwrap();

        assert_eq!(
            pipeline.route(Envelope::new(msg(Kind::B, ""), ())),
            Routed::Dropped { step: 0 }
        );
        assert_eq!(
            pipeline.route(Envelope::new(msg(Kind::C, "hi"), ())),
            Routed::Forwarded { stage: 0 }
        );
        assert_eq!(dest.take()[0].payload.body, "hi");
    }

    #[test]
    fn test_cid_survives_routing() {
        let dest: RecordingDestination<Msg, ()> = RecordingDestination::new();
        let pipeline = RoutingPipeline::builder()
            .stage(Stage::new("a", dest.clone()).tag(Kind::A))
            .build()
            .unwrap();

        let envelope = Envelope::new(msg(Kind::A, "a"), ());
        let cid = envelope.cid;
        pipeline.route(envelope);

        assert_eq!(dest.take()[0].cid, cid);
        assert_eq!(pipeline.stage_name(0), Some("a"));
        assert_eq!(pipeline.match_stage(&msg(Kind::C, "")), None);
    }
}
