//! Rendezvous between a task that sent `create` and the cell reader that
//! receives the answer.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::channel::ConnId;
use crate::circmap::CircKey;

/// How the next hop answered a `create` we sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateResponse {
    /// `created`
    Created,
    /// `create-failed`
    CreateFailed,
    /// `destroy`, or the link went away.
    Destroyed,
}

/// Map from circuits we are creating to the tasks waiting on them.
#[derive(Default)]
pub(crate) struct PendingCreates {
    /// The waiting tasks.
    m: Mutex<HashMap<CircKey, oneshot::Sender<CreateResponse>>>,
}

impl PendingCreates {
    /// Make a new empty map.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Lock the map.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CircKey, oneshot::Sender<CreateResponse>>> {
        self.m.lock().expect("pending create lock poisoned")
    }

    /// Start waiting for the answer to a `create` on `key`.
    ///
    /// Must be called before the `create` is sent.
    pub(crate) fn register(&self, key: CircKey) -> oneshot::Receiver<CreateResponse> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(key, tx);
        rx
    }

    /// Deliver `resp` to whoever waits on `key`.
    ///
    /// Return false if nobody was waiting: the cell is not an answer to a
    /// `create` of ours.
    pub(crate) fn complete(&self, key: CircKey, resp: CreateResponse) -> bool {
        match self.lock().remove(&key) {
            Some(tx) => {
                // The waiter may have timed out; that's fine.
                let _ = tx.send(resp);
                true
            }
            None => false,
        }
    }

    /// Stop waiting on `key`.
    pub(crate) fn cancel(&self, key: CircKey) {
        self.lock().remove(&key);
    }

    /// Tell every waiter on `conn` that the link went away.
    pub(crate) fn remove_conn(&self, conn: ConnId) {
        let mut m = self.lock();
        let keys: Vec<CircKey> = m.keys().filter(|k| k.conn == conn).copied().collect();
        for key in keys {
            if let Some(tx) = m.remove(&key) {
                let _ = tx.send(CreateResponse::Destroyed);
            }
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use onion_cell::chancell::CircId;

    #[tokio::test]
    async fn rendezvous() {
        let pending = PendingCreates::new();
        let conn = ConnId::new();
        let key = CircKey::new(conn, CircId::new(0x8001));

        assert!(!pending.complete(key, CreateResponse::Created));
        let rx = pending.register(key);
        assert!(pending.complete(key, CreateResponse::Created));
        assert_eq!(rx.await.unwrap(), CreateResponse::Created);
        assert!(!pending.complete(key, CreateResponse::Created));
    }

    #[tokio::test]
    async fn link_lost() {
        let pending = PendingCreates::new();
        let conn = ConnId::new();
        let other = ConnId::new();
        let rx1 = pending.register(CircKey::new(conn, CircId::new(1)));
        let rx2 = pending.register(CircKey::new(other, CircId::new(1)));
        pending.remove_conn(conn);
        assert_eq!(rx1.await.unwrap(), CreateResponse::Destroyed);
        assert!(pending.complete(CircKey::new(other, CircId::new(1)), CreateResponse::CreateFailed));
        assert_eq!(rx2.await.unwrap(), CreateResponse::CreateFailed);

        let key = CircKey::new(conn, CircId::new(2));
        let rx3 = pending.register(key);
        pending.cancel(key);
        assert!(rx3.await.is_err());
    }
}
