use fellowship_common::model::user::Actor;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// The signed-in user, if any, shared by every component of the client.
///
/// Authentication itself happens elsewhere; this only records its outcome.
#[derive(Clone, Debug)]
pub struct Session {
    actor: Arc<watch::Sender<Option<Actor>>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        let (actor, _) = watch::channel(None);
        Self {
            actor: Arc::new(actor),
        }
    }

    pub fn sign_in(&self, actor: Actor) {
        debug!(user = %actor.id, "Session started");
        self.actor.send_replace(Some(actor));
    }

    pub fn sign_out(&self) {
        if self.actor.send_replace(None).is_some() {
            debug!("Session ended");
        }
    }

    #[must_use]
    pub fn actor(&self) -> Option<Actor> {
        self.actor.borrow().clone()
    }

    #[must_use]
    pub fn changes(&self) -> watch::Receiver<Option<Actor>> {
        self.actor.subscribe()
    }
}
