//! Passing cells along a circuit.

use std::sync::Arc;

use onion_cell::chancell::codec::set_circ_id;
use onion_cell::chancell::{CircId, RawCell};

use crate::channel::Channel;

/// Send `raw` on `next` under the circuit ID `next_id`, leaving the rest of
/// the cell untouched.
///
/// A failed write closes `next`: its cell reader then tears it down.  We
/// never retry.  Return false if the write failed.
pub(crate) async fn forward_cell(next: &Arc<Channel>, next_id: CircId, raw: &RawCell) -> bool {
    let mut out = *raw;
    set_circ_id(&mut out, next_id);
    match next.write_raw(&out).await {
        Ok(()) => true,
        Err(e) => {
            tor_error::debug_report!(&e, "{}: unable to forward cell; closing", next.unique_id());
            next.close();
            false
        }
    }
}
