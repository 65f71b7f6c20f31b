//! Reconciliation with changes pushed by the backend.
//!
//! A listener never merges pushed rows into the cache. Every relevant change
//! invalidates the cached collections and the refetcher brings the canonical
//! rows, the same path an optimistic write takes when it settles.

use crate::client::{FeedCache, SyncClient};
use fellowship_common::model::{
    Id,
    change::{ChangeEvent, ChangeKind, WatchedTable},
    post::PostMarker,
    user::UserMarker,
};
use fellowship_db::{Backend, ChangeStream, DbError};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("No user is signed in")]
    MissingActor,
    #[error("Could not subscribe to changes: {0}")]
    Subscribe(#[from] DbError),
}

/// Which changes a listener reacts to.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Scope {
    /// Every post and comment, for the whole session.
    Feed,
    /// Comments on one post while its thread is open.
    Thread(Id<PostMarker>),
}

impl Scope {
    fn admits(self, event: &ChangeEvent) -> bool {
        match self {
            Scope::Feed => true,
            Scope::Thread(post) => {
                event.table == WatchedTable::Comments && event.concerns_post(post)
            }
        }
    }
}

/// An open realtime listener. Dropping it stops the listener.
#[derive(Debug)]
pub struct Subscription {
    scope: Scope,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the listener and waits for it to let go of the change stream.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(error) = task.await {
            warn!(%error, "Realtime listener did not shut down cleanly");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Listener {
    cache: Arc<FeedCache>,
    actor: Id<UserMarker>,
    scope: Scope,
    notices: broadcast::Sender<ChangeEvent>,
}

impl Listener {
    async fn run(self, mut changes: ChangeStream, shutdown: CancellationToken) {
        debug!(scope = ?self.scope, "Realtime listener started");
        loop {
            let change = tokio::select! {
                () = shutdown.cancelled() => break,
                change = changes.next() => change,
            };

            match change {
                Some(Ok(event)) => self.reconcile(event),
                Some(Err(error)) => {
                    warn!(%error, "Could not read a change, reloading everything");
                    self.cache.invalidate_all();
                }
                None => {
                    debug!(scope = ?self.scope, "Change stream ended");
                    break;
                }
            }
        }
        debug!(scope = ?self.scope, "Realtime listener stopped");
    }

    fn reconcile(&self, event: ChangeEvent) {
        if !self.scope.admits(&event) {
            return;
        }
        debug!(?event, "Reconciling pushed change");
        self.cache.invalidate_all();

        // The actor already sees their own writes through the optimistic path.
        let notify = self.scope == Scope::Feed
            && event.kind == ChangeKind::Inserted
            && !event.is_authored_by(self.actor);
        if notify {
            // Nobody displaying notices is fine.
            let _ = self.notices.send(event);
        }
    }
}

pub(crate) async fn subscribe(
    backend: &dyn Backend,
    cache: Arc<FeedCache>,
    actor: Id<UserMarker>,
    scope: Scope,
    notices: broadcast::Sender<ChangeEvent>,
) -> Result<Subscription, RealtimeError> {
    let changes = backend.subscribe().await?;
    let shutdown = CancellationToken::new();
    let listener = Listener {
        cache,
        actor,
        scope,
        notices,
    };
    let task = tokio::spawn(listener.run(changes, shutdown.clone()));

    Ok(Subscription {
        scope,
        shutdown,
        task: Some(task),
    })
}

/// Keeps a feed subscription open exactly while the session has a user.
pub fn watch_session(client: SyncClient, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut session = client.session().changes();
        let mut current: Option<Subscription> = None;

        loop {
            let actor = session.borrow_and_update().as_ref().map(|actor| actor.id);
            if let Some(mut open) = current.take() {
                open.close().await;
            }
            if let Some(actor) = actor {
                match client.realtime_feed().await {
                    Ok(subscription) => current = Some(subscription),
                    Err(error) => warn!(%actor, %error, "Could not open realtime subscription"),
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                changed = session.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(mut open) = current.take() {
            open.close().await;
        }
        debug!("Session watcher stopped");
    })
}
