//! Tearing down a channel and everything that depends on it.

use std::sync::Arc;

use tracing::debug;

use crate::channel::Channel;
use crate::circmap::{CircEnt, Hop};
use crate::handler::send_destroy;
use crate::relay::RelayState;

/// Forget `chan` and every circuit and stream on it, telling the other side
/// of each routed circuit with a `destroy`.  Then close the socket.
///
/// Return the number of `destroy` cells sent.
pub(crate) async fn teardown_conn(state: &RelayState, chan: &Arc<Channel>) -> usize {
    let conn = chan.unique_id();
    chan.close();
    state.openers.remove(conn);
    state.links.remove_conn(conn);
    state.pending.remove_conn(conn);

    let mut destroyed = 0;
    for (circ_id, ent) in state.circs.remove_conn(conn) {
        match ent {
            CircEnt::Route(Hop::Relay {
                chan: other,
                circ_id: other_id,
            }) => {
                debug!("{conn}/circ {circ_id}: destroying {}/circ {other_id}", other.unique_id());
                if send_destroy(&other, other_id).await.is_ok() {
                    destroyed += 1;
                }
            }
            CircEnt::Route(Hop::Exit { stream }) => {
                debug!("{conn}/circ {circ_id}: closing stream to {}", stream.target());
                stream.close();
            }
            _ => {}
        }
    }
    state.streams.remove_conn(conn);
    chan.shutdown().await;
    destroyed
}
