//! Helpers shared by the unit tests of this crate.

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

use std::sync::Arc;
use std::time::Duration;

use onion_cell::chancell::codec::ChannelCodec;
use onion_cell::chancell::{ChanCell, RawCell, CELL_LEN};
use tokio::io::AsyncReadExt as _;
use tokio::net::{TcpListener, TcpStream};

use crate::channel::{Channel, LinkRole};
use crate::config::{Listen, RelayConfig};

/// Return two ends of a loopback TCP connection.
pub(crate) async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (connected.unwrap(), accepted.unwrap().0)
}

/// Return a channel over a loopback connection, and the peer's end of it.
pub(crate) async fn fake_channel(role: LinkRole) -> (Arc<Channel>, TcpStream) {
    let (ours, theirs) = socket_pair().await;
    let peer = ours.peer_addr().unwrap();
    let (_rd, wr) = ours.into_split();
    (Channel::new(peer, role, wr), theirs)
}

/// Return a configuration for a relay with agent ID `agent`, on an
/// ephemeral loopback port, with short timeouts.
pub(crate) fn test_config(agent: u32) -> RelayConfig {
    let mut bld = RelayConfig::builder();
    bld.relay()
        .agent_id(agent)
        .listen(Listen::loopback_ephemeral());
    bld.channel()
        .connect_timeout(Duration::from_secs(2))
        .handshake_timeout(Duration::from_secs(2));
    bld.system().shutdown_timeout(Duration::from_secs(5));
    bld.build().unwrap()
}

/// The far end of a [`fake_channel`], reading whole cells.
pub(crate) struct PeerEnd {
    /// The socket.
    sock: TcpStream,
}

impl PeerEnd {
    /// Wrap `sock`.
    pub(crate) fn new(sock: TcpStream) -> Self {
        PeerEnd { sock }
    }

    /// Read and decode the next cell; panic if none arrives soon.
    pub(crate) async fn recv(&mut self) -> ChanCell {
        let mut raw: RawCell = [0_u8; CELL_LEN];
        tokio::time::timeout(Duration::from_secs(5), self.sock.read_exact(&mut raw))
            .await
            .expect("timed out waiting for a cell")
            .unwrap();
        ChannelCodec::new().decode(&raw).unwrap()
    }
}
