use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::presence;
use super::registry::{ConnId, Registry, Session, SharedRegistry};
use crate::protocol;

pub enum Command {
    /// Deliver a line to every live session.
    Broadcast(Arc<str>),
    /// Deliver the current name list to every live session.
    Presence,
}

/// Producer handle for the dispatcher queue. Cheap to clone; one per task.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Command>,
}

impl Dispatcher {
    /// Spawn the dispatcher task over `registry` and return its queue.
    ///
    /// The task exits once every `Dispatcher` clone has been dropped.
    pub fn spawn(registry: SharedRegistry, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_dispatcher(registry, rx, tx.downgrade()));
        Self { tx }
    }

    /// Enqueue a line for every session. Must not be called with the registry
    /// lock held.
    pub async fn broadcast(&self, line: impl Into<Arc<str>>) {
        self.send(Command::Broadcast(line.into())).await;
    }

    pub(crate) async fn send(&self, cmd: Command) {
        if self.tx.send(cmd).await.is_err() {
            tracing::warn!("dispatcher queue closed, message dropped");
        }
    }
}

/// run_dispatcher is the single consumer of the queue. Messages are delivered
/// one at a time with the registry locked, so the fan-outs of two messages
/// never interleave.
async fn run_dispatcher(
    registry: SharedRegistry,
    mut rx: mpsc::Receiver<Command>,
    requeue: mpsc::WeakSender<Command>,
) {
    while let Some(cmd) = rx.recv().await {
        let dropped = {
            let mut registry = registry.lock().await;
            let line = match cmd {
                Command::Broadcast(line) => line,
                Command::Presence => presence::snapshot_line(&registry),
            };
            fan_out(&mut registry, &line)
        };

        if !dropped.is_empty() {
            schedule_failure_notices(&requeue, dropped);
        }
    }
    tracing::debug!("dispatcher stopped");
}

/// Push `line` to every session, removing the ones that can't take it.
fn fan_out(registry: &mut Registry, line: &Arc<str>) -> Vec<Session> {
    let mut failed: Vec<ConnId> = Vec::new();
    registry.for_each_session(|session| match session.deliver(Arc::clone(line)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            tracing::warn!(conn = %session.id(), name = session.name(), "dropping stalled session");
            failed.push(session.id());
        }
        Err(TrySendError::Closed(_)) => {
            tracing::warn!(conn = %session.id(), name = session.name(), "write to session failed");
            failed.push(session.id());
        }
    });

    let dropped: Vec<Session> = failed.into_iter().filter_map(|id| registry.remove(id)).collect();
    if !dropped.is_empty() {
        tracing::info!(dropped = dropped.len(), total = registry.len(), "removed dead sessions");
    }
    dropped
}

/// Tell the remaining sessions about the drops. Runs detached so the
/// dispatcher never waits on its own queue.
fn schedule_failure_notices(requeue: &mpsc::WeakSender<Command>, dropped: Vec<Session>) {
    let Some(tx) = requeue.upgrade() else {
        return;
    };
    let names: Vec<String> = dropped.iter().map(|s| s.name().to_string()).collect();
    // Closing the dropped queues lets their writers shut the connections down.
    drop(dropped);

    tokio::spawn(async move {
        for name in names {
            let notice = protocol::failure_notice(&name);
            if tx.send(Command::Broadcast(notice.into())).await.is_err() {
                return;
            }
        }
        tx.send(Command::Presence).await.ok();
    });
}
