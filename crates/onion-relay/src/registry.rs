//! Per-relay tables about links: which agent each link leads to, and which
//! links completed the `open` handshake.

use std::collections::{hash_map::Entry, HashMap};
use std::sync::{Arc, Mutex};

use onion_cell::chancell::AgentId;

use crate::channel::{Channel, ConnId};

/// Map from a remote agent ID to the channel we use to reach it.
///
/// At most one live channel is registered per agent.  The first live
/// registration wins: a later channel to the same agent stays usable for
/// the circuits already on it, but is never handed out by [`get`](Self::get).
#[derive(Default)]
pub(crate) struct ChanRegistry {
    /// The channels, by agent.
    chans: Mutex<HashMap<AgentId, Arc<Channel>>>,
}

impl ChanRegistry {
    /// Make a new empty registry.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Lock the map.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AgentId, Arc<Channel>>> {
        self.chans.lock().expect("channel registry lock poisoned")
    }

    /// Register `chan` as the channel to `agent`.
    ///
    /// Return false if another live channel is already registered.
    pub(crate) fn register(&self, agent: AgentId, chan: &Arc<Channel>) -> bool {
        match self.lock().entry(agent) {
            Entry::Occupied(mut e) => {
                if e.get().is_closed() {
                    e.insert(Arc::clone(chan));
                    true
                } else {
                    Arc::ptr_eq(e.get(), chan)
                }
            }
            Entry::Vacant(v) => {
                v.insert(Arc::clone(chan));
                true
            }
        }
    }

    /// Return the live channel registered for `agent`, if any.
    pub(crate) fn get(&self, agent: AgentId) -> Option<Arc<Channel>> {
        self.lock()
            .get(&agent)
            .filter(|chan| !chan.is_closed())
            .cloned()
    }

    /// Remove `conn` from the registry, if it is registered.
    pub(crate) fn remove_conn(&self, conn: ConnId) {
        self.lock().retain(|_, chan| chan.unique_id() != conn);
    }

    /// Return the number of registered channels.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// The result of a completed `open` handshake on one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Opener {
    /// The agent that sent `open`.
    pub(crate) opener: AgentId,
    /// The agent that answered with `opened`.
    pub(crate) opened: AgentId,
}

/// Map from a link to the result of its `open` handshake.
///
/// Links without an entry have not been opened: we honour no `create` or
/// `relay` cell on them.
#[derive(Default)]
pub(crate) struct OpenerMap {
    /// The records.
    m: Mutex<HashMap<ConnId, Opener>>,
}

impl OpenerMap {
    /// Make a new empty map.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record that `conn` was opened.
    ///
    /// Return false and change nothing if it was opened already.
    pub(crate) fn record(&self, conn: ConnId, opener: Opener) -> bool {
        match self
            .m
            .lock()
            .expect("opener map lock poisoned")
            .entry(conn)
        {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(opener);
                true
            }
        }
    }

    /// Return the record for `conn`, if it was opened.
    pub(crate) fn get(&self, conn: ConnId) -> Option<Opener> {
        self.m
            .lock()
            .expect("opener map lock poisoned")
            .get(&conn)
            .copied()
    }

    /// Forget about `conn`.
    pub(crate) fn remove(&self, conn: ConnId) -> Option<Opener> {
        self.m.lock().expect("opener map lock poisoned").remove(&conn)
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
    use crate::channel::LinkRole;
    use crate::test_util::fake_channel;

    #[tokio::test]
    async fn first_live_registration_wins() {
        let reg = ChanRegistry::new();
        let agent = AgentId::from(77_u32);
        let (a, _pa) = fake_channel(LinkRole::Responder).await;
        let (b, _pb) = fake_channel(LinkRole::Initiator).await;

        assert!(reg.get(agent).is_none());
        assert!(reg.register(agent, &a));
        assert!(reg.register(agent, &a));
        assert!(!reg.register(agent, &b));
        assert_eq!(reg.get(agent).unwrap().unique_id(), a.unique_id());

        // Once a closes, it is no longer handed out, and b may replace it.
        a.close();
        assert!(reg.get(agent).is_none());
        assert!(reg.register(agent, &b));
        assert_eq!(reg.get(agent).unwrap().unique_id(), b.unique_id());
        assert_eq!(reg.len(), 1);

        reg.remove_conn(b.unique_id());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn opener_once() {
        let map = OpenerMap::new();
        let conn = ConnId::new();
        let rec = Opener {
            opener: AgentId::from(1_u32),
            opened: AgentId::from(2_u32),
        };
        assert!(map.get(conn).is_none());
        assert!(map.record(conn, rec));
        assert!(!map.record(
            conn,
            Opener {
                opener: AgentId::from(3_u32),
                opened: AgentId::from(2_u32),
            }
        ));
        assert_eq!(map.get(conn), Some(rec));
        assert_eq!(map.remove(conn), Some(rec));
        assert!(map.get(conn).is_none());
    }
}
