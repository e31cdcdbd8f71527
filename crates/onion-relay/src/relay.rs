//! Entry point of an onion relay: the [`OnionRelay`] and [`RelayHandle`]
//! objects.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use onion_cell::chancell::codec::ChannelCodec;
use onion_cell::chancell::AgentId;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::circmap::CircMap;
use crate::config::{ChannelConfig, RelayConfig};
use crate::pending::PendingCreates;
use crate::registry::{ChanRegistry, OpenerMap};
use crate::streams::StreamMap;
use crate::{Error, Result};

/// The state shared by every task of one relay.
///
/// Each table has its own lock; no code path holds two of them at once.
pub(crate) struct RelayState {
    /// The agent ID we answer to in `open`.
    pub(crate) agent_id: AgentId,
    /// Timeouts for channels and streams.
    pub(crate) chan_config: ChannelConfig,
    /// Codec for cells we receive.
    pub(crate) codec: ChannelCodec,
    /// The circuit table.
    pub(crate) circs: CircMap,
    /// The stream table.
    pub(crate) streams: StreamMap,
    /// The connection registry.
    pub(crate) links: ChanRegistry,
    /// The opener registry.
    pub(crate) openers: OpenerMap,
    /// Outstanding `create` cells we sent.
    pub(crate) pending: PendingCreates,
    /// Cancelled when the relay is stopping.
    pub(crate) shutdown: CancellationToken,
    /// Every task the relay spawned.
    pub(crate) tasks: TaskTracker,
}

impl RelayState {
    /// Make the state for a relay with the given configuration.
    pub(crate) fn new(config: &RelayConfig) -> Arc<Self> {
        Arc::new(RelayState {
            agent_id: config.relay.agent_id.into(),
            chan_config: config.channel.clone(),
            codec: ChannelCodec::new(),
            circs: CircMap::new(),
            streams: StreamMap::new(),
            links: ChanRegistry::new(),
            openers: OpenerMap::new(),
            pending: PendingCreates::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }
}

/// A relay that has bound its listening sockets, but doesn't accept
/// connections yet.
pub struct OnionRelay {
    /// The configuration options for the relay.
    config: RelayConfig,
    /// Listening sockets.
    listeners: Vec<TcpListener>,
}

impl OnionRelay {
    /// Bind the listening sockets named by `config`.
    ///
    /// Failing to listen on any address is fatal; an address family the
    /// system doesn't support only gets a warning.
    pub async fn bind(config: RelayConfig) -> anyhow::Result<Self> {
        let mut listeners = vec![];
        // We bind sequentially rather than with something like `join_all` to make errors more
        // reproducible.
        for addr in config.relay.listen.addrs() {
            match TcpListener::bind(*addr).await {
                Ok(listener) => listeners.push(listener),
                // If we don't support the address family (typically IPv6), only warn.
                #[cfg(unix)]
                Err(ref e) if e.raw_os_error() == Some(libc::EAFNOSUPPORT) => {
                    if addr.is_ipv6() {
                        warn!("Could not listen at {addr}: address family not supported");
                    } else {
                        warn!("Could not listen at {addr}: address family not supported: {e}");
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to listen at address {addr}"));
                }
            }
        }

        // Every address may have failed with `EAFNOSUPPORT`.
        if listeners.is_empty() {
            return Err(anyhow::anyhow!(
                "Could not listen at any address: {}",
                crate::util::iter_join(", ", config.relay.listen.addrs()),
            ));
        }

        Ok(Self { config, listeners })
    }

    /// Return the addresses we are listening on.
    pub fn local_addrs(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|l| l.local_addr().context("Failed to get listener address"))
            .collect()
    }

    /// Return the agent ID of this relay.
    pub fn agent_id(&self) -> AgentId {
        self.config.relay.agent_id.into()
    }

    /// Start accepting connections.
    pub fn launch(self) -> anyhow::Result<RelayHandle> {
        let local_addrs = self.local_addrs()?;
        let state = RelayState::new(&self.config);
        for listener in self.listeners {
            let state_ = Arc::clone(&state);
            state
                .tasks
                .spawn(crate::tasks::listeners::cell_listener(state_, listener));
        }
        info!(
            "Relay {} listening at {}",
            state.agent_id,
            crate::util::iter_join(", ", local_addrs.iter()),
        );
        Ok(RelayHandle {
            state,
            local_addrs,
            shutdown_timeout: self.config.system.shutdown_timeout,
        })
    }
}

/// A snapshot of a relay's tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct RelayStats {
    /// Circuit table entries, in any state.
    pub circuits: usize,
    /// Circuit table entries that route cells elsewhere.
    pub routes: usize,
    /// Links in the connection registry.
    pub links: usize,
    /// Live streams.
    pub streams: usize,
}

/// A running relay.
///
/// Dropping the handle does not stop the relay; call
/// [`shutdown`](RelayHandle::shutdown).
pub struct RelayHandle {
    /// The relay's shared state.
    state: Arc<RelayState>,
    /// The addresses we are listening on.
    local_addrs: Vec<SocketAddr>,
    /// How long to wait for tasks when stopping.
    shutdown_timeout: std::time::Duration,
}

impl RelayHandle {
    /// Return the agent ID of this relay.
    pub fn agent_id(&self) -> AgentId {
        self.state.agent_id
    }

    /// Return the addresses we are listening on.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Return a snapshot of the relay's tables.
    pub fn stats(&self) -> RelayStats {
        let counts = self.state.circs.counts();
        RelayStats {
            circuits: counts.pending + counts.routes,
            routes: counts.routes,
            links: self.state.links.len(),
            streams: self.state.streams.len(),
        }
    }

    /// Stop the relay.
    ///
    /// Stops accepting connections, closes every channel (each sending
    /// `destroy` along its circuits) and stream, then waits for all tasks to
    /// exit, for at most the configured shutdown timeout.
    pub async fn shutdown(self) -> Result<()> {
        info!("Relay {} shutting down", self.state.agent_id);
        // Every cell reader sees this and tears its channel down.
        self.state.shutdown.cancel();
        self.state.tasks.close();
        match tokio::time::timeout(self.shutdown_timeout, self.state.tasks.wait()).await {
            Ok(()) => {
                debug!("All relay tasks stopped");
                Ok(())
            }
            Err(_) => Err(Error::Timeout("relay tasks to stop")),
        }
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("agent_id", &self.state.agent_id)
            .field("local_addrs", &self.local_addrs)
            .finish_non_exhaustive()
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
    use crate::config::Listen;
    use crate::test_util::test_config;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn bind_and_stop() {
        let relay = OnionRelay::bind(test_config(41)).await.unwrap();
        assert_eq!(relay.agent_id(), AgentId::from(41_u32));
        let addrs = relay.local_addrs().unwrap();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);

        let handle = relay.launch().unwrap();
        assert_eq!(handle.local_addrs(), &addrs[..]);
        assert_eq!(handle.stats(), RelayStats::default());
        assert!(logs_contain("Relay 41 listening at"));
        handle.shutdown().await.unwrap();
        assert!(logs_contain("All relay tasks stopped"));

        // Nobody accepts any more.
        assert!(tokio::net::TcpStream::connect(addrs[0]).await.is_err());
    }

    #[tokio::test]
    async fn bind_in_use() {
        let first = OnionRelay::bind(test_config(1)).await.unwrap();
        let addr = first.local_addrs().unwrap()[0];

        let mut config = test_config(2);
        config.relay.listen = Listen::new_addrs([addr]).unwrap();
        let err = OnionRelay::bind(config).await.err().unwrap();
        assert!(err.to_string().contains("Failed to listen"));
    }
}
