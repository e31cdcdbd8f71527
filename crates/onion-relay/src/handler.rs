//! The command handler: what the relay does with each cell it reads.
//!
//! Cells on a circuit that routes elsewhere are forwarded without being
//! decoded.  Only cells for which this relay is the terminus are
//! interpreted, so the same code serves the first, middle and last hop.
//!
//! Handling happens inside the cell reader of the channel the cell arrived
//! on.  The only exception is `extend`, which runs in its own task: its
//! handshake may need this very reader to deliver the answer.

use std::sync::Arc;

use onion_cell::chancell::codec::{circ_id_of, cmd_of};
use onion_cell::chancell::msg::{AnyChanMsg, Open};
use onion_cell::chancell::{ChanCell, ChanCmd, CircId, RawCell};
use onion_cell::relaycell::msg::{AnyRelayMsg, Begin, Extend};
use onion_cell::relaycell::{RelayCell, StreamId};
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::circmap::{CircEnt, CircKey, Hop};
use crate::exit::ExitStream;
use crate::pending::CreateResponse;
use crate::registry::Opener;
use crate::relay::RelayState;
use crate::{Error, Result};

/// Handle one cell read from `chan`.
///
/// Return an error only if `chan` itself is no longer usable.
pub(crate) async fn handle_cell(
    state: &Arc<RelayState>,
    chan: &Arc<Channel>,
    raw: &RawCell,
) -> Result<()> {
    let circ_id = circ_id_of(raw);
    if !circ_id.is_channel() {
        let key = CircKey::new(chan.unique_id(), circ_id);
        if let Some(CircEnt::Route(Hop::Relay {
            chan: next,
            circ_id: next_id,
        })) = state.circs.get(key)
        {
            if cmd_of(raw) == ChanCmd::DESTROY {
                state.circs.remove_circ(key);
                debug!("{key}: destroyed; passing it on");
            } else {
                trace!("{key}: forwarding {} cell", cmd_of(raw));
            }
            crate::forward::forward_cell(&next, next_id, raw).await;
            return Ok(());
        }
    }

    let cell = match state.codec.decode(raw) {
        Ok(cell) => cell,
        Err(e) => {
            let e = Error::from_cell_dec(e, "channel cell");
            tor_error::debug_report!(&e, "{}: dropping cell", chan.unique_id());
            return Ok(());
        }
    };
    let (circ_id, msg) = cell.into_circid_and_msg();
    let key = CircKey::new(chan.unique_id(), circ_id);

    match msg {
        AnyChanMsg::Open(open) => handle_open(state, chan, open).await,
        AnyChanMsg::Opened(_) | AnyChanMsg::OpenFailed(_) => {
            debug!("{}: unexpected {} cell; dropping", chan.unique_id(), cmd_of(raw));
            Ok(())
        }
        AnyChanMsg::Create => handle_create(state, chan, key).await,
        AnyChanMsg::Created => {
            complete_pending(state, key, CreateResponse::Created);
            Ok(())
        }
        AnyChanMsg::CreateFailed => {
            complete_pending(state, key, CreateResponse::CreateFailed);
            Ok(())
        }
        AnyChanMsg::Destroy => {
            if !state.pending.complete(key, CreateResponse::Destroyed) {
                handle_destroy(state, key).await;
            }
            Ok(())
        }
        AnyChanMsg::Relay(cell) => handle_relay(state, chan, circ_id, cell).await,
        _ => {
            debug!("{}: unhandled {} cell; dropping", chan.unique_id(), cmd_of(raw));
            Ok(())
        }
    }
}

/// Deliver an answer to a `create` of ours.
fn complete_pending(state: &RelayState, key: CircKey, resp: CreateResponse) {
    if !state.pending.complete(key, resp) {
        debug!("{key}: {resp:?} for a circuit we didn't create; dropping");
    }
}

/// Handle an `open` cell: the first cell on a link.
async fn handle_open(state: &RelayState, chan: &Arc<Channel>, open: Open) -> Result<()> {
    let conn = chan.unique_id();
    let accept = open.opened() == state.agent_id
        && state.openers.record(
            conn,
            Opener {
                opener: open.opener(),
                opened: open.opened(),
            },
        );
    if !accept {
        debug!(
            "{conn}: refusing open from agent {} for agent {}",
            open.opener(),
            open.opened()
        );
        return chan
            .send_cell(ChanCell::new(CircId::CHANNEL, AnyChanMsg::OpenFailed(open)))
            .await;
    }

    debug!("{conn}: opened by agent {}", open.opener());
    if !state.links.register(open.opener(), chan) {
        debug!(
            "{conn}: already have a link to agent {}; not registering",
            open.opener()
        );
    }
    chan.send_cell(ChanCell::new(CircId::CHANNEL, AnyChanMsg::Opened(open)))
        .await
}

/// Handle a `create` cell.
async fn handle_create(state: &RelayState, chan: &Channel, key: CircKey) -> Result<()> {
    let reply = if state.openers.get(key.conn).is_none() {
        debug!("{key}: create on a link that was never opened");
        AnyChanMsg::CreateFailed
    } else if state.circs.create(key) {
        debug!("{key}: created");
        AnyChanMsg::Created
    } else {
        debug!("{key}: circuit ID already in use");
        AnyChanMsg::CreateFailed
    };
    chan.send_cell(ChanCell::new(key.circ_id, reply)).await
}

/// Handle a `destroy` cell for a circuit we are the terminus of.
///
/// Destroying an unknown circuit does nothing.
pub(crate) async fn handle_destroy(state: &RelayState, key: CircKey) {
    match state.circs.remove_circ(key) {
        None => debug!("{key}: destroy for unknown circuit; ignoring"),
        Some(CircEnt::Route(Hop::Exit { stream })) => {
            debug!("{key}: destroyed; closing stream to {}", stream.target());
            state.streams.end(key);
            stream.close();
        }
        // Routed destroys are normally forwarded before decoding; this is
        // an extend that finished after that check.
        Some(CircEnt::Route(Hop::Relay { chan, circ_id })) => {
            debug!("{key}: destroyed as its extend finished; passing it on");
            let _ = send_destroy(&chan, circ_id).await;
        }
        Some(_) => debug!("{key}: destroyed"),
    }
}

/// Send `destroy` for `circ_id` on `chan`.
///
/// A failed write closes `chan`.
pub(crate) async fn send_destroy(chan: &Channel, circ_id: CircId) -> Result<()> {
    let r = chan
        .send_cell(ChanCell::new(circ_id, AnyChanMsg::Destroy))
        .await;
    if r.is_err() {
        chan.close();
    }
    r
}

/// Send a relay message on `chan`.
pub(crate) async fn send_relay(
    chan: &Channel,
    circ_id: CircId,
    stream_id: StreamId,
    msg: AnyRelayMsg,
) -> Result<()> {
    let cell = RelayCell::new(stream_id, msg);
    chan.send_cell(ChanCell::new(circ_id, AnyChanMsg::Relay(cell)))
        .await
}

/// Handle a `relay` cell for a circuit that doesn't route elsewhere.
async fn handle_relay(
    state: &Arc<RelayState>,
    chan: &Arc<Channel>,
    circ_id: CircId,
    cell: RelayCell,
) -> Result<()> {
    let key = CircKey::new(chan.unique_id(), circ_id);
    if state.openers.get(key.conn).is_none() {
        debug!("{key}: relay cell on a link that was never opened; dropping");
        return Ok(());
    }

    let (stream_id, msg) = cell.into_streamid_and_msg();
    match (state.circs.get(key), msg) {
        (Some(CircEnt::Unresolved), AnyRelayMsg::Begin(begin)) => {
            handle_begin(state, chan, circ_id, stream_id, begin).await
        }
        (Some(CircEnt::Unresolved), AnyRelayMsg::Extend(extend)) => {
            handle_extend(state, chan, circ_id, stream_id, extend).await
        }
        (Some(CircEnt::Route(Hop::Exit { stream })), AnyRelayMsg::Data(data)) => {
            if !state.streams.is_live(key) {
                debug!("{key}: data after end of stream; dropping");
                return Ok(());
            }
            if let Err(e) = stream.write(data.as_ref()).await {
                tor_error::debug_report!(&e, "{}: unable to write to destination", key);
                // Its data pump stops on this.
                stream.close();
            }
            Ok(())
        }
        (Some(CircEnt::Route(Hop::Exit { .. })), AnyRelayMsg::End) => {
            if state.streams.end(key) {
                debug!("{key}: stream ended by originator");
            }
            Ok(())
        }
        (ent, AnyRelayMsg::Begin(_)) => {
            debug!("{key}: can't begin a stream here ({})", describe(ent.as_ref()));
            send_relay(chan, circ_id, stream_id, AnyRelayMsg::BeginFailed).await
        }
        (ent, AnyRelayMsg::Extend(_)) => {
            debug!("{key}: can't extend from here ({})", describe(ent.as_ref()));
            send_relay(chan, circ_id, stream_id, AnyRelayMsg::ExtendFailed).await
        }
        (ent, msg) => {
            debug!(
                "{key}: dropping {} relay message ({})",
                msg.cmd(),
                describe(ent.as_ref())
            );
            Ok(())
        }
    }
}

/// Describe a circuit table entry for a log message.
fn describe(ent: Option<&CircEnt>) -> &'static str {
    match ent {
        None => "no such circuit",
        Some(CircEnt::Unresolved) => "circuit unresolved",
        Some(CircEnt::Extending) => "circuit extending",
        Some(CircEnt::Opening) => "circuit opening",
        Some(CircEnt::Route(Hop::Exit { .. })) => "stream already open",
        Some(CircEnt::Route(Hop::Relay { .. })) => "circuit extended",
    }
}

/// Handle a `begin` on an unresolved circuit: connect to the destination,
/// and start pumping its data back.
async fn handle_begin(
    state: &Arc<RelayState>,
    chan: &Arc<Channel>,
    circ_id: CircId,
    stream_id: StreamId,
    begin: Begin,
) -> Result<()> {
    let key = CircKey::new(chan.unique_id(), circ_id);
    let target = begin.into_target();
    let connect = tokio::time::timeout(
        state.chan_config.connect_timeout,
        ExitStream::connect(&target),
    )
    .await
    .unwrap_or(Err(Error::Timeout("destination connection")));

    let (exit, rd) = match connect {
        Ok(x) => x,
        Err(e) => {
            tor_error::debug_report!(&e, "{}: begin failed", key);
            return send_relay(chan, circ_id, stream_id, AnyRelayMsg::BeginFailed).await;
        }
    };

    let opened = state.streams.open(&mut rand::rng(), key);
    let (new_stream_id, live) = match opened {
        Ok(x) => x,
        Err(e) => {
            tor_error::debug_report!(&e, "{}: begin failed", key);
            exit.shutdown().await;
            return send_relay(chan, circ_id, stream_id, AnyRelayMsg::BeginFailed).await;
        }
    };
    if !state.circs.add_exit(chan, circ_id, &exit) {
        // Destroyed while we were connecting.
        debug!("{key}: circuit changed during begin; dropping stream");
        state.streams.end_id(key, new_stream_id);
        exit.shutdown().await;
        return Ok(());
    }
    debug!(
        "{key}: stream {new_stream_id} open to {} via {}",
        exit.target(),
        exit.unique_id()
    );

    send_relay(chan, circ_id, new_stream_id, AnyRelayMsg::Connected).await?;
    state.tasks.spawn(crate::tasks::pump::data_pump(
        Arc::clone(state),
        Arc::clone(chan),
        circ_id,
        new_stream_id,
        exit,
        rd,
        live,
    ));
    Ok(())
}

/// Handle an `extend` on an unresolved circuit: mark it extending, and
/// hand it to an extend task.
async fn handle_extend(
    state: &Arc<RelayState>,
    chan: &Arc<Channel>,
    circ_id: CircId,
    stream_id: StreamId,
    extend: Extend,
) -> Result<()> {
    let key = CircKey::new(chan.unique_id(), circ_id);
    if !state.circs.start_extend(key) {
        debug!("{key}: circuit changed before extend");
        return send_relay(chan, circ_id, stream_id, AnyRelayMsg::ExtendFailed).await;
    }
    debug!("{key}: extending to agent {}", extend.agent());
    state.tasks.spawn(crate::tasks::extend::extend_circuit(
        Arc::clone(state),
        Arc::clone(chan),
        circ_id,
        stream_id,
        extend,
    ));
    Ok(())
}
