//! Downstream handlers the dispatcher forwards to.
//!
//! Each worker is a tokio task draining an unbounded inbox. Workers answer on
//! the envelope's reply channel; a reply nobody is listening for is dropped.

use controlflow::Envelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::signal::{Reply, ReplyTo, Signal, SignalEnvelope};

/// Inbox of a worker task.
pub type WorkerInbox = mpsc::UnboundedSender<SignalEnvelope>;

fn reply(reply_to: &ReplyTo, reply: Reply) {
    if reply_to.send(reply).is_err() {
        debug!("reply channel closed, reply dropped");
    }
}

/// Spawn the search worker. The task returns how many searches it accepted.
pub fn spawn_search_worker() -> (WorkerInbox, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalEnvelope>();

    let task = tokio::spawn(async move {
        let mut accepted = 0;
        while let Some(Envelope {
            payload,
            reply_to,
            cid,
        }) = rx.recv().await
        {
            let sudo = payload.is_sudo();
            match payload {
                Signal::ThingSearch { filter, namespaces }
                | Signal::SudoThingSearch { filter, namespaces } => {
                    accepted += 1;
                    debug!(cid = %cid, sudo, filter = ?filter, "search accepted");
                    reply(
                        &reply_to,
                        Reply::SearchAccepted {
                            cid: cid.to_string(),
                            filter,
                            namespaces,
                            sudo,
                        },
                    );
                }
                other => warn!(cid = %cid, kind = ?other.kind(), "search worker got a non-search signal"),
            }
        }
        accepted
    });

    (tx, task)
}

/// Spawn the things aggregator. The task returns how many requests it served.
///
/// Duplicate thing IDs are answered once, keeping first-seen order.
pub fn spawn_things_aggregator() -> (WorkerInbox, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalEnvelope>();

    let task = tokio::spawn(async move {
        let mut served = 0;
        while let Some(Envelope {
            payload,
            reply_to,
            cid,
        }) = rx.recv().await
        {
            let sudo = payload.is_sudo();
            match payload {
                Signal::RetrieveThings { thing_ids } | Signal::SudoRetrieveThings { thing_ids } => {
                    served += 1;
                    let mut unique: Vec<String> = Vec::with_capacity(thing_ids.len());
                    for id in thing_ids {
                        if !unique.contains(&id) {
                            unique.push(id);
                        }
                    }
                    debug!(cid = %cid, sudo, things = unique.len(), "retrieve served");
                    reply(
                        &reply_to,
                        Reply::Things {
                            cid: cid.to_string(),
                            thing_ids: unique,
                            sudo,
                        },
                    );
                }
                other => warn!(cid = %cid, kind = ?other.kind(), "aggregator got a non-retrieve signal"),
            }
        }
        served
    });

    (tx, task)
}
