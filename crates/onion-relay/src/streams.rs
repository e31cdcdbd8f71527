//! The stream table: liveness of the streams opened by `begin`.
//!
//! Streams are keyed by the circuit they were opened on.  The stream ID we
//! hand back in `connected` is only a token for the originator; we never
//! look a stream up by it.

use std::collections::{hash_map::Entry, HashMap};
use std::sync::Mutex;

use onion_cell::relaycell::StreamId;
use rand::Rng;
use tokio::sync::watch;

use crate::channel::ConnId;
use crate::circmap::CircKey;
use crate::{Error, Result};

/// One live stream.
struct StreamEnt {
    /// The ID we gave the originator.
    id: StreamId,
    /// Set to false when the stream ends.
    live: watch::Sender<bool>,
}

/// Map from circuit keys to stream liveness flags.
#[derive(Default)]
pub(crate) struct StreamMap {
    /// The streams.
    m: Mutex<HashMap<CircKey, StreamEnt>>,
}

impl StreamMap {
    /// Make a new empty stream map.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Lock the map.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CircKey, StreamEnt>> {
        self.m.lock().expect("stream map lock poisoned")
    }

    /// Mark a stream on `key` as live, and give it a stream ID that no
    /// other live stream uses.
    ///
    /// Return the ID and a receiver that sees the flag drop when the stream
    /// ends.  A stream already live on `key` is ended first.
    pub(crate) fn open<R: Rng>(
        &self,
        rng: &mut R,
        key: CircKey,
    ) -> Result<(StreamId, watch::Receiver<bool>)> {
        /// How many random stream IDs do we try before giving up?
        const N_ATTEMPTS: usize = 16;
        let mut m = self.lock();
        let id = (0..N_ATTEMPTS)
            .map(|_| StreamId::from(rng.random_range(1..=u16::MAX)))
            .find(|id| !m.values().any(|ent| ent.id == *id))
            .ok_or(Error::IdRangeFull)?;
        let (tx, rx) = watch::channel(true);
        match m.entry(key) {
            Entry::Occupied(mut e) => {
                e.get().live.send_replace(false);
                e.insert(StreamEnt { id, live: tx });
            }
            Entry::Vacant(v) => {
                v.insert(StreamEnt { id, live: tx });
            }
        }
        Ok((id, rx))
    }

    /// Clear the flag of the stream on `key`, and forget it.
    ///
    /// Return false if there was no live stream.
    pub(crate) fn end(&self, key: CircKey) -> bool {
        match self.lock().remove(&key) {
            Some(ent) => {
                ent.live.send_replace(false);
                true
            }
            None => false,
        }
    }

    /// Like [`end`](Self::end), but only if the stream on `key` is the one
    /// we called `id`.
    pub(crate) fn end_id(&self, key: CircKey, id: StreamId) -> bool {
        let mut m = self.lock();
        match m.get(&key) {
            Some(ent) if ent.id == id => {
                ent.live.send_replace(false);
                m.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Return true if there is a live stream on `key`.
    pub(crate) fn is_live(&self, key: CircKey) -> bool {
        self.lock().contains_key(&key)
    }

    /// End every stream on `conn`.  Return how many there were.
    pub(crate) fn remove_conn(&self, conn: ConnId) -> usize {
        let mut m = self.lock();
        let before = m.len();
        m.retain(|key, ent| {
            if key.conn == conn {
                ent.live.send_replace(false);
                false
            } else {
                true
            }
        });
        before - m.len()
    }

    /// Return the number of live streams.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
