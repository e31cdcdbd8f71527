//! Connection listening tasks of the relay.

use std::sync::Arc;

use safelog::Sensitive;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::channel::{Channel, LinkRole};
use crate::relay::RelayState;

/// Accept connections on `listener` until the relay stops, running a cell
/// reader for each.
pub(crate) async fn cell_listener(state: Arc<RelayState>, listener: TcpListener) {
    let local_addr = listener.local_addr().ok();
    loop {
        let next = tokio::select! {
            () = state.shutdown.cancelled() => break,
            next = listener.accept() => next,
        };

        let (stream, remote_addr) = match next {
            Ok(x) => x,
            Err(e) => {
                // This likely indicates a system configuration issue (for example max num of
                // open files too low); future connections will likely fail as well.
                warn!("Dropping incoming connection: {e}");
                continue;
            }
        };

        // This may be sensitive (for example if this is an originator connecting to its first
        // hop).
        let remote_addr = Sensitive::new(remote_addr);
        debug!(
            "New incoming connection from {remote_addr} on local address {}",
            local_addr.map(|a| a.to_string()).unwrap_or_default(),
        );

        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let chan = Channel::new(remote_addr.into_inner(), LinkRole::Responder, wr);
        state.tasks.spawn(crate::tasks::reader::cell_reader(
            Arc::clone(&state),
            chan,
            rd,
        ));
    }
    debug!("Listener stopped");
}
