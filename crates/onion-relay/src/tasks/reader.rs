//! The cell reader: one task per channel, reading cells and handing each to
//! the command handler in order.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use onion_cell::chancell::{RawCell, CELL_LEN};
use tokio::io::AsyncReadExt as _;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::err::ReactorError;
use crate::relay::RelayState;
use crate::Error;

/// Read cells from `rd` until the channel closes, the peer goes idle, or
/// the relay stops; then tear the channel down.
///
/// The returned future is boxed: an extend handled by this reader may
/// spawn the reader of another channel, and the compiler cannot see that
/// such a recursive chain of futures is `Send` unless one link is named.
pub(crate) fn cell_reader(
    state: Arc<RelayState>,
    chan: Arc<Channel>,
    rd: OwnedReadHalf,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(run_reader(state, chan, rd))
}

/// Body of [`cell_reader`].
async fn run_reader(state: Arc<RelayState>, chan: Arc<Channel>, mut rd: OwnedReadHalf) {
    let id = chan.unique_id();
    debug!("{id}: reading cells from {}", chan.peer());

    match read_cells(&state, &chan, &mut rd).await {
        Err(ReactorError::Shutdown) => debug!("{id}: channel closing"),
        Err(ReactorError::Idle) => info!("{id}: no cell for too long; closing channel"),
        Err(ReactorError::Err(e)) => {
            tor_error::debug_report!(&e, "{}: channel failed", id);
        }
        Ok(void) => void::unreachable(void),
    }

    let destroyed = crate::teardown::teardown_conn(&state, &chan).await;
    debug!("{id}: torn down; sent {destroyed} destroy cells");
}

/// Run the read loop of a channel.
///
/// Only returns on error.
async fn read_cells(
    state: &Arc<RelayState>,
    chan: &Arc<Channel>,
    rd: &mut OwnedReadHalf,
) -> Result<void::Void, ReactorError> {
    let idle_timeout = state.chan_config.idle_timeout;
    let mut raw: RawCell = [0_u8; CELL_LEN];
    loop {
        let read = tokio::select! {
            biased;
            () = state.shutdown.cancelled() => return Err(ReactorError::Shutdown),
            () = chan.wait_closed() => return Err(ReactorError::Shutdown),
            read = tokio::time::timeout(idle_timeout, rd.read_exact(&mut raw)) => read,
        };
        match read {
            Err(_elapsed) => return Err(ReactorError::Idle),
            // The peer hung up, possibly in the middle of a cell.
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ReactorError::Shutdown)
            }
            Ok(Err(e)) => return Err(Error::ChanIoErr(Arc::new(e)).into()),
            Ok(Ok(_)) => {}
        }
        crate::handler::handle_cell(state, chan, &raw).await?;
    }
}
