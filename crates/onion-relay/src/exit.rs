//! Streams from the last hop of a circuit to a destination.

use std::sync::Arc;

use onion_cell::relaycell::msg::StreamTarget;
use safelog::Sensitive;
use tokio::io::AsyncWriteExt as _;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::ConnId;
use crate::{Error, Result};

/// The relay's end of a TCP connection to a stream destination.
///
/// The read half is owned by the stream's data pump.
pub(crate) struct ExitStream {
    /// Process-unique identifier for this connection.
    unique_id: ConnId,
    /// Where we connected to.
    target: StreamTarget,
    /// The write half of the socket.
    writer: Mutex<OwnedWriteHalf>,
    /// Cancelled when the stream is closing.
    closed: CancellationToken,
}

impl ExitStream {
    /// Connect to `target`.
    ///
    /// Return the stream and the read half of its socket.
    pub(crate) async fn connect(target: &StreamTarget) -> Result<(Arc<Self>, OwnedReadHalf)> {
        let stream = TcpStream::connect((target.host(), target.port()))
            .await
            .map_err(|e| Error::ConnectErr {
                target: target.to_string(),
                err: Arc::new(e),
            })?;
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let exit = Arc::new(ExitStream {
            unique_id: ConnId::new(),
            target: target.clone(),
            writer: Mutex::new(wr),
            closed: CancellationToken::new(),
        });
        Ok((exit, rd))
    }

    /// Return the unique identifier of this connection.
    pub(crate) fn unique_id(&self) -> ConnId {
        self.unique_id
    }

    /// Return the destination, wrapped for logging.
    pub(crate) fn target(&self) -> Sensitive<&StreamTarget> {
        Sensitive::new(&self.target)
    }

    /// Write application bytes to the destination.
    pub(crate) async fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|e| Error::ChanIoErr(Arc::new(e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::ChanIoErr(Arc::new(e)))
    }

    /// Mark this stream as closing; its data pump will stop and close the
    /// socket.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Return true if this stream is closing.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until this stream is closing.
    pub(crate) async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Close the stream and shut down the write half of the socket.
    pub(crate) async fn shutdown(&self) {
        self.close();
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl std::fmt::Debug for ExitStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitStream")
            .field("unique_id", &self.unique_id)
            .field("target", &self.target())
            .finish_non_exhaustive()
    }
}
