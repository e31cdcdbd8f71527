//! Channels: the relay's side of a TCP connection to a neighbour.
//!
//! A [`Channel`] owns the write half of its socket behind a per-channel
//! lock, so that cells written by different tasks are never interleaved.
//! The read half belongs to the channel's cell reader task.

use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use onion_cell::chancell::codec::ChannelCodec;
use onion_cell::chancell::{ChanCell, RawCell};
use safelog::Sensitive;
use tokio::io::AsyncWriteExt as _;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::circmap::CircIdRange;
use crate::{Error, Result};

/// Counter for allocating unique identifiers for connections.
static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Unique identifier for a connection: a channel, or a stream to a
/// destination.
///
/// These identifiers are unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ConnId(usize);

impl ConnId {
    /// Construct a new ConnId.
    pub(crate) fn new() -> Self {
        // Relaxed ordering is fine; we don't care about how this
        // is instantiated with respect to other connections.
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        assert!(id != usize::MAX, "Exhausted the connection ID namespace");
        ConnId(id)
    }
}

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Conn {}", self.0)
    }
}

/// Which end of the TCP connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkRole {
    /// We connected to the peer (to extend a circuit).
    Initiator,
    /// The peer connected to us.
    Responder,
}

impl LinkRole {
    /// Return the range from which we allocate circuit IDs on a channel
    /// where we have this role.
    pub(crate) fn circ_id_range(self) -> CircIdRange {
        match self {
            LinkRole::Initiator => CircIdRange::High,
            LinkRole::Responder => CircIdRange::Low,
        }
    }
}

/// One TCP connection to another relay or to an originator.
pub(crate) struct Channel {
    /// Process-unique identifier for this channel.
    unique_id: ConnId,
    /// The address of the peer.
    peer: SocketAddr,
    /// Which end of the connection we are.
    role: LinkRole,
    /// Codec used to encode cells we originate.
    codec: ChannelCodec,
    /// The write half of the socket.
    ///
    /// Held for the whole duration of a cell write.
    writer: Mutex<OwnedWriteHalf>,
    /// Cancelled when the channel is closing.
    closed: CancellationToken,
}

impl Channel {
    /// Wrap the write half of a connected socket.
    pub(crate) fn new(peer: SocketAddr, role: LinkRole, writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Channel {
            unique_id: ConnId::new(),
            peer,
            role,
            codec: ChannelCodec::new(),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        })
    }

    /// Return the unique identifier of this channel.
    pub(crate) fn unique_id(&self) -> ConnId {
        self.unique_id
    }

    /// Return the address of the peer, wrapped for logging.
    pub(crate) fn peer(&self) -> Sensitive<SocketAddr> {
        Sensitive::new(self.peer)
    }

    /// Return which end of the connection we are.
    pub(crate) fn role(&self) -> LinkRole {
        self.role
    }

    /// Encode `cell` and send it.
    pub(crate) async fn send_cell(&self, cell: ChanCell) -> Result<()> {
        let raw = self
            .codec
            .encode(cell)
            .map_err(|e| Error::from_cell_enc(e, "channel cell"))?;
        self.write_raw(&raw).await
    }

    /// Encode `cell` and send it, provided that `wanted` still returns true
    /// once no other cell is being written.
    ///
    /// Return whether the cell was sent.
    pub(crate) async fn send_cell_if<F>(&self, cell: ChanCell, wanted: F) -> Result<bool>
    where
        F: FnOnce() -> bool,
    {
        let raw = self
            .codec
            .encode(cell)
            .map_err(|e| Error::from_cell_enc(e, "channel cell"))?;
        self.write_raw_if(&raw, wanted).await
    }

    /// Write an already-encoded cell, and flush it.
    pub(crate) async fn write_raw(&self, raw: &RawCell) -> Result<()> {
        self.write_raw_if(raw, || true).await.map(|_| ())
    }

    /// Write and flush `raw` if `wanted` returns true while we hold the
    /// writer.
    async fn write_raw_if<F>(&self, raw: &RawCell, wanted: F) -> Result<bool>
    where
        F: FnOnce() -> bool,
    {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let mut writer = self.writer.lock().await;
        if !wanted() {
            return Ok(false);
        }
        writer
            .write_all(&raw[..])
            .await
            .map_err(|e| Error::ChanIoErr(Arc::new(e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::ChanIoErr(Arc::new(e)))?;
        Ok(true)
    }

    /// Mark this channel as closing.
    ///
    /// The cell reader notices, stops, and tears the channel down.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Return true if this channel is closing.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until this channel is closing.
    pub(crate) async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Close the channel and shut down the write half of the socket.
    pub(crate) async fn shutdown(&self) {
        self.close();
        // The peer may already be gone; nothing to do about it.
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("unique_id", &self.unique_id)
            .field("peer", &self.peer())
            .field("role", &self.role)
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
    use crate::test_util::socket_pair;
    use onion_cell::chancell::msg::AnyChanMsg;
    use onion_cell::chancell::{CircId, CELL_LEN};
    use tokio::io::AsyncReadExt as _;

    #[test]
    fn conn_unique_id() {
        let ids: Vec<ConnId> = (0..10).map(|_| ConnId::new()).collect();

        // Make sure we got distinct numbers
        let mut all_nums: Vec<_> = ids.iter().map(|x| x.0).collect();
        all_nums.sort_unstable();
        all_nums.dedup();
        assert_eq!(all_nums.len(), ids.len());

        assert_eq!(format!("{}", ids[3]), format!("Conn {}", ids[3].0));
    }

    #[tokio::test]
    async fn send_and_close() {
        let (ours, mut theirs) = socket_pair().await;
        let peer = ours.peer_addr().unwrap();
        let (_rd, wr) = ours.into_split();
        let chan = Channel::new(peer, LinkRole::Responder, wr);

        chan.send_cell(ChanCell::new(CircId::new(7), AnyChanMsg::Created))
            .await
            .unwrap();
        let mut buf = [0_u8; CELL_LEN];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..3], &[0, 7, 2]);

        chan.shutdown().await;
        assert!(chan.is_closed());
        assert!(matches!(
            chan.send_cell(ChanCell::new(CircId::new(7), AnyChanMsg::Destroy))
                .await,
            Err(Error::ChannelClosed)
        ));
        // The peer sees end-of-stream.
        assert_eq!(theirs.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn send_if_checks_under_lock() {
        let (ours, mut theirs) = socket_pair().await;
        let peer = ours.peer_addr().unwrap();
        let (_rd, wr) = ours.into_split();
        let chan = Channel::new(peer, LinkRole::Responder, wr);
        let (tx, rx) = tokio::sync::watch::channel(true);

        // Someone else is writing while the flag drops.
        let busy = chan.writer.lock().await;
        let send = {
            let chan = Arc::clone(&chan);
            tokio::spawn(async move {
                let cell = ChanCell::new(CircId::new(7), AnyChanMsg::Destroy);
                chan.send_cell_if(cell, || *rx.borrow()).await.unwrap()
            })
        };
        tokio::task::yield_now().await;
        tx.send_replace(false);
        drop(busy);
        assert!(!send.await.unwrap());

        // With the flag up, the cell goes out.
        tx.send_replace(true);
        let rx = tx.subscribe();
        let cell = ChanCell::new(CircId::new(8), AnyChanMsg::Destroy);
        assert!(chan.send_cell_if(cell, || *rx.borrow()).await.unwrap());
        let mut buf = [0_u8; CELL_LEN];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..3], &[0, 8, 4]);
    }
}
