//! The extend task: builds the next hop of a circuit for a `relay extend`.

use std::sync::Arc;

use onion_cell::chancell::msg::AnyChanMsg;
use onion_cell::chancell::{AgentId, ChanCell, CircId};
use onion_cell::relaycell::msg::{AnyRelayMsg, Extend, StreamTarget};
use onion_cell::relaycell::StreamId;
use tokio::net::TcpStream;
use tracing::debug;

use crate::channel::{Channel, LinkRole};
use crate::circmap::{CircKey, ExtendOutcome};
use crate::handler::{send_destroy, send_relay};
use crate::pending::CreateResponse;
use crate::registry::Opener;
use crate::relay::RelayState;
use crate::{Error, Result};

/// Extend circuit `circ_id` of `prev` to the relay named in `extend`, and
/// answer with `extended` or `extend-failed`.
///
/// The circuit must already be marked as extending.  On failure it is
/// unresolved again, so the originator may retry.
pub(crate) async fn extend_circuit(
    state: Arc<RelayState>,
    prev: Arc<Channel>,
    circ_id: CircId,
    stream_id: StreamId,
    extend: Extend,
) {
    let key = CircKey::new(prev.unique_id(), circ_id);
    let (target, agent) = extend.into_parts();

    let reply = match build_next_hop(&state, &target, agent).await {
        Ok((next, next_id)) => match state.circs.finish_extend(&prev, circ_id, &next, next_id) {
            ExtendOutcome::Extended => {
                debug!("{key}: extended to {}/circ {next_id}", next.unique_id());
                AnyRelayMsg::Extended
            }
            ExtendOutcome::PrevClosed => {
                // The circuit went away while we were building; so must the new hop.
                debug!("{key}: circuit closed during extend");
                let _ = send_destroy(&next, next_id).await;
                return;
            }
            ExtendOutcome::NextClosed => {
                debug!("{key}: next hop closed during extend");
                AnyRelayMsg::ExtendFailed
            }
        },
        Err(e) => {
            tor_error::debug_report!(&e, "{}: extend to agent {} failed", key, agent);
            state.circs.abandon_extend(key);
            AnyRelayMsg::ExtendFailed
        }
    };
    if send_relay(&prev, circ_id, stream_id, reply).await.is_err() {
        prev.close();
    }
}

/// Find or make a channel to `agent` at `target`, and create a circuit on
/// it.
///
/// Return the channel and the new circuit's ID.
async fn build_next_hop(
    state: &Arc<RelayState>,
    target: &StreamTarget,
    agent: AgentId,
) -> Result<(Arc<Channel>, CircId)> {
    let next = match state.links.get(agent) {
        Some(chan) => {
            debug!("Reusing {} to agent {agent}", chan.unique_id());
            chan
        }
        None => connect_next_hop(state, target, agent).await?,
    };

    let next_id = state.circs.add_opening(&mut rand::rng(), &next)?;
    let next_key = CircKey::new(next.unique_id(), next_id);
    let answer = state.pending.register(next_key);

    let created = async {
        next.send_cell(ChanCell::new(next_id, AnyChanMsg::Create))
            .await?;
        match tokio::time::timeout(state.chan_config.handshake_timeout, answer).await {
            Err(_) => Err(Error::Timeout("created cell")),
            // The link went away.
            Ok(Err(_)) => Err(Error::CircuitClosed),
            Ok(Ok(CreateResponse::Created)) => Ok(()),
            Ok(Ok(CreateResponse::CreateFailed)) => Err(Error::CreateRefused),
            Ok(Ok(CreateResponse::Destroyed)) => Err(Error::CircuitClosed),
        }
    }
    .await;

    if let Err(e) = created {
        state.pending.cancel(next_key);
        state.circs.remove_opening(next_key);
        return Err(e);
    }
    Ok((next, next_id))
}

/// Open a new channel to `agent` at `target`, register it, and start its
/// cell reader.
async fn connect_next_hop(
    state: &Arc<RelayState>,
    target: &StreamTarget,
    agent: AgentId,
) -> Result<Arc<Channel>> {
    let timeouts = &state.chan_config;
    let mut stream = tokio::time::timeout(
        timeouts.connect_timeout,
        TcpStream::connect((target.host(), target.port())),
    )
    .await
    .map_err(|_| Error::Timeout("next hop connection"))?
    .map_err(|e| Error::ConnectErr {
        target: target.to_string(),
        err: Arc::new(e),
    })?;
    let _ = stream.set_nodelay(true);
    crate::client::open_handshake(&mut stream, state.agent_id, agent, timeouts.handshake_timeout)
        .await?;

    let peer = stream
        .peer_addr()
        .map_err(|e| Error::HandshakeIoErr(Arc::new(e)))?;
    let (rd, wr) = stream.into_split();
    let chan = Channel::new(peer, LinkRole::Initiator, wr);
    state.openers.record(
        chan.unique_id(),
        Opener {
            opener: state.agent_id,
            opened: agent,
        },
    );
    if !state.links.register(agent, &chan) {
        debug!("{}: lost race to register agent {agent}", chan.unique_id());
    }
    debug!("{}: opened to agent {agent} at {}", chan.unique_id(), chan.peer());
    state.tasks.spawn(crate::tasks::reader::cell_reader(
        Arc::clone(state),
        Arc::clone(&chan),
        rd,
    ));
    Ok(chan)
}
