//! The dispatcher: routes search and retrieve signals to their workers.
//!
//! ```text
//!               ┌ ThingSearch ─────────┐
//! signal ─► pre-step ─► search stage ──┤ SudoThingSearch ──► SEARCH_ACTOR_PATH (via directory)
//!               │
//!               └► retrieve stage ─┬ RetrieveThings ──────► things aggregator
//!                                  └ SudoRetrieveThings ──┘
//!                     │ unhandled
//!                     ▼
//!                dead letter
//! ```
//!
//! The running dispatcher is a [`RouterSession`] registered in the directory
//! under [`DISPATCHER_ACTOR_PATH`], so anything holding the directory can send
//! it signals by path.

use controlflow::{
    Destination, Directory, FlowError, RouterSession, RoutingPipeline, SessionHandle,
    SessionStats, Stage, Step,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::signal::{ReplyTo, Signal, SignalEnvelope, SignalKind};

/// Where the search worker is registered.
pub const SEARCH_ACTOR_PATH: &str = "/user/thingsSearchRoot/thingsSearch";

/// Where the dispatcher session registers itself.
pub const DISPATCHER_ACTOR_PATH: &str = "/user/dispatcherActor";

/// Where the things aggregator is registered.
pub const AGGREGATOR_ACTOR_PATH: &str = "/user/dispatcherActor/aggregator";

/// Build the dispatcher pipeline.
///
/// Search signals go to whatever is registered at [`SEARCH_ACTOR_PATH`],
/// retrieve signals to `aggregator`, everything else is dead-lettered.
pub fn dispatcher_pipeline(
    directory: &Directory<Signal, ReplyTo>,
    aggregator: impl Destination<Signal, ReplyTo> + 'static,
) -> Result<RoutingPipeline<Signal, ReplyTo>, FlowError> {
    dispatch_stages(directory, aggregator, None)
}

/// Like [`dispatcher_pipeline`], running `pre_step` on every signal first.
pub fn dispatcher_pipeline_with_pre_step(
    directory: &Directory<Signal, ReplyTo>,
    aggregator: impl Destination<Signal, ReplyTo> + 'static,
    pre_step: Step<Signal, ReplyTo>,
) -> Result<RoutingPipeline<Signal, ReplyTo>, FlowError> {
    dispatch_stages(directory, aggregator, Some(pre_step))
}

fn dispatch_stages(
    directory: &Directory<Signal, ReplyTo>,
    aggregator: impl Destination<Signal, ReplyTo> + 'static,
    pre_step: Option<Step<Signal, ReplyTo>>,
) -> Result<RoutingPipeline<Signal, ReplyTo>, FlowError> {
    let mut builder = RoutingPipeline::builder().name("dispatcher");
    if let Some(step) = pre_step {
        builder = builder.step(step);
    }

    builder
        .stage(
            Stage::new("search", directory.destination(SEARCH_ACTOR_PATH))
                .tag(SignalKind::ThingSearch)
                .tag(SignalKind::SudoThingSearch),
        )
        .stage(
            Stage::new("retrieve", aggregator)
                .tag(SignalKind::RetrieveThings)
                .tag(SignalKind::SudoRetrieveThings),
        )
        .dead_letter()
        .build()
}

/// Pre-step dropping retrieve signals that name no things.
pub fn reject_empty_retrieve() -> Step<Signal, ReplyTo> {
    Step::new("reject-empty-retrieve", |envelope: SignalEnvelope| {
        match &envelope.payload {
            Signal::RetrieveThings { thing_ids } | Signal::SudoRetrieveThings { thing_ids }
                if thing_ids.is_empty() =>
            {
                warn!(cid = %envelope.cid, "retrieve without thing ids rejected");
                None
            }
            _ => Some(envelope),
        }
    })
}

/// Run `pipeline` in a session registered at [`DISPATCHER_ACTOR_PATH`].
///
/// # Errors
///
/// [`FlowError::DestinationAlreadyRegistered`] if another dispatcher holds
/// the path. The new session is stopped again and the registered dispatcher
/// is left in place.
pub fn spawn_dispatcher(
    directory: &Directory<Signal, ReplyTo>,
    pipeline: RoutingPipeline<Signal, ReplyTo>,
    capacity: usize,
) -> Result<(SessionHandle<Signal, ReplyTo>, JoinHandle<SessionStats>), FlowError> {
    let (handle, task) = RouterSession::spawn(pipeline, capacity)?;
    if let Err(e) = directory.register(DISPATCHER_ACTOR_PATH, handle.clone()) {
        task.abort();
        return Err(e);
    }
    info!(path = DISPATCHER_ACTOR_PATH, "dispatcher started");

    Ok((handle, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use controlflow::testing::RecordingDestination;
    use controlflow::{Envelope, Routed};
    use tokio::sync::mpsc;

    fn reply_to() -> ReplyTo {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn test_search_and_sudo_search_share_a_stage() {
        let directory = Directory::new();
        let search = RecordingDestination::new();
        directory.register(SEARCH_ACTOR_PATH, search.clone()).unwrap();
        let aggregator = RecordingDestination::new();

        let pipeline = dispatcher_pipeline(&directory, aggregator.clone()).unwrap();

        for signal in [
            Signal::ThingSearch {
                filter: None,
                namespaces: vec![],
            },
            Signal::SudoThingSearch {
                filter: None,
                namespaces: vec![],
            },
        ] {
            assert_eq!(
                pipeline.route(Envelope::new(signal, reply_to())),
                Routed::Forwarded { stage: 0 }
            );
        }

        assert_eq!(search.len(), 2);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_other_signals_are_dead_lettered() {
        let directory = Directory::new();
        let aggregator: RecordingDestination<Signal, ReplyTo> = RecordingDestination::new();
        let pipeline = dispatcher_pipeline(&directory, aggregator.clone()).unwrap();

        let routed = pipeline.route(Envelope::new(
            Signal::Other {
                name: "ModifyAttribute".into(),
                payload: serde_json::Value::Null,
            },
            reply_to(),
        ));

        assert_eq!(routed, Routed::DeadLettered);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_pre_step_rejects_empty_retrieve() {
        let directory = Directory::new();
        let aggregator: RecordingDestination<Signal, ReplyTo> = RecordingDestination::new();
        let pipeline =
            dispatcher_pipeline_with_pre_step(&directory, aggregator.clone(), reject_empty_retrieve())
                .unwrap();

        let empty = Signal::RetrieveThings { thing_ids: vec![] };
        let full = Signal::SudoRetrieveThings {
            thing_ids: vec!["org.acme:lamp-1".into()],
        };

        assert_eq!(
            pipeline.route(Envelope::new(empty, reply_to())),
            Routed::Dropped { step: 0 }
        );
        assert_eq!(
            pipeline.route(Envelope::new(full, reply_to())),
            Routed::Forwarded { stage: 1 }
        );
        assert_eq!(aggregator.len(), 1);
    }

    #[tokio::test]
    async fn test_second_dispatcher_is_refused() {
        let directory = Directory::new();
        let aggregator: RecordingDestination<Signal, ReplyTo> = RecordingDestination::new();

        let first = dispatcher_pipeline(&directory, aggregator.clone()).unwrap();
        let (_handle, _task) = spawn_dispatcher(&directory, first, 8).unwrap();

        let second = dispatcher_pipeline(&directory, aggregator).unwrap();
        let err = spawn_dispatcher(&directory, second, 8).unwrap_err();

        assert!(matches!(err, FlowError::DestinationAlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn test_refused_dispatcher_leaves_first_in_place() {
        let directory = Directory::new();
        let aggregator: RecordingDestination<Signal, ReplyTo> = RecordingDestination::new();

        let first = dispatcher_pipeline(&directory, aggregator.clone()).unwrap();
        let (handle, task) = spawn_dispatcher(&directory, first, 8).unwrap();

        let second = dispatcher_pipeline(&directory, aggregator.clone()).unwrap();
        assert!(spawn_dispatcher(&directory, second, 8).is_err());

        assert!(directory.send(
            DISPATCHER_ACTOR_PATH,
            Envelope::new(
                Signal::RetrieveThings {
                    thing_ids: vec!["org.acme:a".into()],
                },
                reply_to(),
            ),
        ));
        drop(handle);
        directory.unregister(DISPATCHER_ACTOR_PATH);

        let stats = task.await.unwrap();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(aggregator.len(), 1);
    }
}
