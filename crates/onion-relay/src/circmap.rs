//! Types and code to map circuit keys to circuit entries.
//!
//! Circuit IDs are only unique per connection, so entries are keyed by
//! [`CircKey`]: a connection and a circuit ID on it.  One map holds the
//! entries for every connection of the relay.

use std::collections::{hash_map::Entry, HashMap};
use std::sync::{Arc, Mutex};

use onion_cell::chancell::CircId;
use rand::distr::Distribution;
use rand::Rng;

use crate::channel::{Channel, ConnId};
use crate::exit::ExitStream;
use crate::{Error, Result};

/// Which group of circuit IDs are we allowed to allocate on a channel?
///
/// If we initiated the channel, we use High circuit ids.  If we're the
/// responder, we use low circuit ids.
#[derive(Copy, Clone, Debug)]
pub(crate) enum CircIdRange {
    /// Only use circuit IDs with the MSB cleared.
    Low,
    /// Only use circuit IDs with the MSB set.
    High,
}

impl Distribution<CircId> for CircIdRange {
    /// Return a random circuit ID in the appropriate range.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> CircId {
        let midpoint = 0x8000_u16;
        let v = match self {
            // 0 is an invalid value
            CircIdRange::Low => rng.random_range(1..midpoint),
            CircIdRange::High => rng.random_range(midpoint..=u16::MAX),
        };
        CircId::new(v)
    }
}

/// Identifies one circuit at this relay: a connection, and the circuit ID
/// used on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CircKey {
    /// The connection.
    pub(crate) conn: ConnId,
    /// The circuit ID on that connection.
    pub(crate) circ_id: CircId,
}

impl CircKey {
    /// Make a new CircKey.
    pub(crate) fn new(conn: ConnId, circ_id: CircId) -> Self {
        CircKey { conn, circ_id }
    }
}

impl std::fmt::Display for CircKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/circ {}", self.conn, self.circ_id)
    }
}

/// Where cells arriving on a resolved circuit go.
#[derive(Debug, Clone)]
pub(crate) enum Hop {
    /// To another channel, under another circuit ID.
    Relay {
        /// The channel to forward to.
        chan: Arc<Channel>,
        /// The circuit ID to use on that channel.
        circ_id: CircId,
    },
    /// To a destination stream that we opened for a `begin`.
    Exit {
        /// The stream.
        stream: Arc<ExitStream>,
    },
}

impl Hop {
    /// Return the key of the paired entry that points back at us.
    pub(crate) fn reverse_key(&self, circ_id: CircId) -> CircKey {
        match self {
            Hop::Relay { chan, circ_id } => CircKey::new(chan.unique_id(), *circ_id),
            Hop::Exit { stream } => CircKey::new(stream.unique_id(), circ_id),
        }
    }
}

/// An entry in the circuit map.
#[derive(Debug, Clone)]
pub(crate) enum CircEnt {
    /// We are the last hop of this circuit, and nothing has been asked of
    /// it yet.
    Unresolved,
    /// An `extend` for this circuit is in progress.
    Extending,
    /// We sent a `create` for this circuit and are waiting for the answer.
    Opening,
    /// Cells on this circuit go somewhere else.
    Route(Hop),
}

/// Counts of entries in a [`CircMap`], by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CircCounts {
    /// Entries that are unresolved, extending, or opening.
    pub(crate) pending: usize,
    /// Entries that route to another hop.
    pub(crate) routes: usize,
}

/// What [`CircMap::finish_extend`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExtendOutcome {
    /// Both sides are routed to each other.
    Extended,
    /// The circuit being extended is gone; so is the new one.
    PrevClosed,
    /// The new circuit is gone; the one being extended is unresolved
    /// again.
    NextClosed,
}

/// A map from circuit keys to circuit entries.  Each relay has one.
///
/// Every method takes the lock exactly once, so each is atomic with
/// respect to the others.
#[derive(Default)]
pub(crate) struct CircMap {
    /// Map from circuit keys to entries
    m: Mutex<HashMap<CircKey, CircEnt>>,
}

impl CircMap {
    /// Make a new empty CircMap
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Lock the map.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CircKey, CircEnt>> {
        self.m.lock().expect("circuit map lock poisoned")
    }

    /// Return a copy of the entry for `key`, if any.
    pub(crate) fn get(&self, key: CircKey) -> Option<CircEnt> {
        self.lock().get(&key).cloned()
    }

    /// If there is no entry for `key`, add an unresolved one and return
    /// true.  Otherwise return false.
    pub(crate) fn create(&self, key: CircKey) -> bool {
        match self.lock().entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(CircEnt::Unresolved);
                true
            }
        }
    }

    /// If `key` is unresolved, mark it as extending and return true.
    pub(crate) fn start_extend(&self, key: CircKey) -> bool {
        match self.lock().get_mut(&key) {
            Some(ent @ CircEnt::Unresolved) => {
                *ent = CircEnt::Extending;
                true
            }
            _ => false,
        }
    }

    /// If `key` is extending, mark it as unresolved again.
    pub(crate) fn abandon_extend(&self, key: CircKey) {
        if let Some(ent @ CircEnt::Extending) = self.lock().get_mut(&key) {
            *ent = CircEnt::Unresolved;
        }
    }

    /// Allocate an unused circuit ID on `chan`, and record it as opening.
    pub(crate) fn add_opening<R: Rng>(&self, rng: &mut R, chan: &Channel) -> Result<CircId> {
        /// How many times do we probe for a random circuit ID before
        /// we assume that the range is fully populated?
        const N_ATTEMPTS: usize = 16;
        let mut m = self.lock();
        let iter = chan.role().circ_id_range().sample_iter(rng).take(N_ATTEMPTS);
        for id in iter {
            if let Entry::Vacant(v) = m.entry(CircKey::new(chan.unique_id(), id)) {
                v.insert(CircEnt::Opening);
                return Ok(id);
            }
        }
        Err(Error::IdRangeFull)
    }

    /// Complete an extend: route `prev` to `next` and back.
    ///
    /// `prev` must be extending and `next` must be opening.  If `prev` is no
    /// longer extending (it was destroyed while we waited), remove `next`.
    /// If `next` is gone (its channel closed after answering), put `prev`
    /// back to unresolved.
    pub(crate) fn finish_extend(
        &self,
        prev_chan: &Arc<Channel>,
        prev_id: CircId,
        next_chan: &Arc<Channel>,
        next_id: CircId,
    ) -> ExtendOutcome {
        let prev = CircKey::new(prev_chan.unique_id(), prev_id);
        let next = CircKey::new(next_chan.unique_id(), next_id);
        let mut m = self.lock();
        let prev_ok = matches!(m.get(&prev), Some(CircEnt::Extending));
        let next_ok = matches!(m.get(&next), Some(CircEnt::Opening));
        match (prev_ok, next_ok) {
            (true, true) => {}
            (false, _) => {
                if next_ok {
                    m.remove(&next);
                }
                return ExtendOutcome::PrevClosed;
            }
            (true, false) => {
                m.insert(prev, CircEnt::Unresolved);
                return ExtendOutcome::NextClosed;
            }
        }
        m.insert(
            prev,
            CircEnt::Route(Hop::Relay {
                chan: Arc::clone(next_chan),
                circ_id: next_id,
            }),
        );
        m.insert(
            next,
            CircEnt::Route(Hop::Relay {
                chan: Arc::clone(prev_chan),
                circ_id: prev_id,
            }),
        );
        ExtendOutcome::Extended
    }

    /// Route `source` to the destination `stream`, and the stream back to
    /// `source_chan`.
    ///
    /// `source` must be unresolved; otherwise return false and change
    /// nothing.
    pub(crate) fn add_exit(
        &self,
        source_chan: &Arc<Channel>,
        circ_id: CircId,
        stream: &Arc<ExitStream>,
    ) -> bool {
        let source = CircKey::new(source_chan.unique_id(), circ_id);
        let mut m = self.lock();
        match m.get_mut(&source) {
            Some(ent @ CircEnt::Unresolved) => {
                *ent = CircEnt::Route(Hop::Exit {
                    stream: Arc::clone(stream),
                });
            }
            _ => return false,
        }
        m.insert(
            CircKey::new(stream.unique_id(), circ_id),
            CircEnt::Route(Hop::Relay {
                chan: Arc::clone(source_chan),
                circ_id,
            }),
        );
        true
    }

    /// Remove the entry for `key`, along with the paired entry if `key` was
    /// routed.
    ///
    /// Return the removed entry.
    pub(crate) fn remove_circ(&self, key: CircKey) -> Option<CircEnt> {
        let mut m = self.lock();
        let ent = m.remove(&key)?;
        if let CircEnt::Route(hop) = &ent {
            m.remove(&hop.reverse_key(key.circ_id));
        }
        Some(ent)
    }

    /// Remove the entry for `key` only if it is opening.
    pub(crate) fn remove_opening(&self, key: CircKey) {
        let mut m = self.lock();
        if matches!(m.get(&key), Some(CircEnt::Opening)) {
            m.remove(&key);
        }
    }

    /// Remove every entry keyed by `conn`, along with the paired entries of
    /// the routed ones.
    ///
    /// Return the removed entries, with their circuit IDs.
    pub(crate) fn remove_conn(&self, conn: ConnId) -> Vec<(CircId, CircEnt)> {
        let mut m = self.lock();
        let keys: Vec<CircKey> = m.keys().filter(|k| k.conn == conn).copied().collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(ent) = m.remove(&key) {
                if let CircEnt::Route(hop) = &ent {
                    m.remove(&hop.reverse_key(key.circ_id));
                }
                removed.push((key.circ_id, ent));
            }
        }
        removed
    }

    /// Return the number of entries in the map, by state.
    pub(crate) fn counts(&self) -> CircCounts {
        let m = self.lock();
        let routes = m
            .values()
            .filter(|ent| matches!(ent, CircEnt::Route(_)))
            .count();
        CircCounts {
            pending: m.len() - routes,
            routes,
        }
    }
}
