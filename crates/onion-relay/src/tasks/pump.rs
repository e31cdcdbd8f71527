//! The data pump: carries bytes from a destination back along the circuit
//! that opened the stream.

use std::sync::Arc;

use onion_cell::chancell::msg::AnyChanMsg;
use onion_cell::chancell::{ChanCell, CircId};
use onion_cell::relaycell::msg::{AnyRelayMsg, Data};
use onion_cell::relaycell::{RelayCell, StreamId};
use tokio::io::AsyncReadExt as _;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tracing::debug;

use crate::channel::Channel;
use crate::circmap::CircKey;
use crate::exit::ExitStream;
use crate::handler::send_relay;
use crate::relay::RelayState;

/// Why a data pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    /// The destination closed its side.
    DestinationClosed,
    /// The originator ended the stream.
    Ended,
    /// The circuit or the channel went away, or the relay is stopping.
    Closed,
}

/// Read from the destination and send what we read as `data` cells on
/// `circ_id` of `source`, while the stream is live.
///
/// When the destination closes first, tell the originator with `end`.
/// On exit, close the destination and mark the stream ended.
pub(crate) async fn data_pump(
    state: Arc<RelayState>,
    source: Arc<Channel>,
    circ_id: CircId,
    stream_id: StreamId,
    exit: Arc<ExitStream>,
    rd: OwnedReadHalf,
    live: watch::Receiver<bool>,
) {
    let key = CircKey::new(source.unique_id(), circ_id);
    let why = pump(&state, &source, circ_id, stream_id, &exit, rd, live).await;
    debug!("{key}: stream {stream_id} to {} stopped: {why:?}", exit.target());

    if why == PumpEnd::DestinationClosed
        && send_relay(&source, circ_id, stream_id, AnyRelayMsg::End)
            .await
            .is_err()
    {
        source.close();
    }
    exit.shutdown().await;
    state.streams.end_id(key, stream_id);
}

/// Run the loop of a data pump.
async fn pump(
    state: &RelayState,
    source: &Channel,
    circ_id: CircId,
    stream_id: StreamId,
    exit: &ExitStream,
    mut rd: OwnedReadHalf,
    mut live: watch::Receiver<bool>,
) -> PumpEnd {
    let mut buf = vec![0_u8; Data::MAXLEN];
    loop {
        if !*live.borrow_and_update() {
            return PumpEnd::Ended;
        }
        let n = tokio::select! {
            biased;
            () = state.shutdown.cancelled() => return PumpEnd::Closed,
            () = exit.wait_closed() => return PumpEnd::Closed,
            () = source.wait_closed() => return PumpEnd::Closed,
            changed = live.changed() => {
                if changed.is_err() {
                    // The stream table dropped our flag: the stream is gone.
                    return PumpEnd::Ended;
                }
                continue;
            }
            n = rd.read(&mut buf) => n,
        };
        let n = match n {
            Ok(0) => return PumpEnd::DestinationClosed,
            Ok(n) => n,
            Err(e) => {
                debug!("{circ_id}: error reading from destination: {e}");
                return PumpEnd::DestinationClosed;
            }
        };
        let data = match Data::new(&buf[..n]) {
            Ok(data) => data,
            Err(e) => {
                // We never read more than fits.
                debug!("{circ_id}: can't make data cell: {e}");
                return PumpEnd::Closed;
            }
        };
        let cell = ChanCell::new(
            circ_id,
            AnyChanMsg::Relay(RelayCell::new(stream_id, AnyRelayMsg::Data(data))),
        );
        // An end may arrive while we read or wait for the writer.
        match source.send_cell_if(cell, || *live.borrow()).await {
            Ok(true) => {}
            Ok(false) => return PumpEnd::Ended,
            Err(_) => {
                source.close();
                return PumpEnd::Closed;
            }
        }
    }
}
