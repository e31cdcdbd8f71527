//! The originator's side of a link to a relay.
//!
//! A [`ClientChannel`] is what a proxy front-end (or a test) uses to build
//! circuits through relays and open streams over them.  It speaks the same
//! cells as the relays do, over one TCP connection to the first hop.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> onion_relay::Result<()> {
//! use std::time::Duration;
//! use onion_cell::chancell::CircId;
//! use onion_relay::client::ClientChannel;
//!
//! let addr = "127.0.0.1:9001".parse().unwrap();
//! let mut chan =
//!     ClientChannel::connect(addr, 1_u32.into(), 1234_u32.into(), Duration::from_secs(10))
//!         .await?;
//! let circ = CircId::new(5);
//! chan.create(circ).await?;
//! let stream = chan.begin(circ, "example.com:80".parse().unwrap()).await?;
//! chan.send_data(circ, stream, b"GET / HTTP/1.0\r\n\r\n").await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use onion_cell::chancell::codec::ChannelCodec;
use onion_cell::chancell::msg::{AnyChanMsg, Open};
use onion_cell::chancell::{AgentId, ChanCell, CircId, RawCell, CELL_LEN};
use onion_cell::relaycell::msg::{AnyRelayMsg, Begin, Data, Extend, StreamTarget};
use onion_cell::relaycell::{RelayCell, StreamId};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tracing::trace;

use crate::{Error, Result};

/// Write `cell` to `stream`.
async fn write_cell(stream: &mut TcpStream, codec: &ChannelCodec, cell: ChanCell) -> Result<()> {
    let raw = codec
        .encode(cell)
        .map_err(|e| Error::from_cell_enc(e, "channel cell"))?;
    stream
        .write_all(&raw[..])
        .await
        .map_err(|e| Error::ChanIoErr(Arc::new(e)))?;
    stream
        .flush()
        .await
        .map_err(|e| Error::ChanIoErr(Arc::new(e)))
}

/// Read one cell from `stream`, waiting at most `timeout`.
async fn read_cell(
    stream: &mut TcpStream,
    codec: &ChannelCodec,
    timeout: Duration,
    waiting_for: &'static str,
) -> Result<ChanCell> {
    let mut raw: RawCell = [0_u8; CELL_LEN];
    match tokio::time::timeout(timeout, stream.read_exact(&mut raw)).await {
        Err(_) => return Err(Error::Timeout(waiting_for)),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::ChannelClosed)
        }
        Ok(Err(e)) => return Err(Error::ChanIoErr(Arc::new(e))),
        Ok(Ok(_)) => {}
    }
    codec
        .decode(&raw)
        .map_err(|e| Error::from_cell_dec(e, "channel cell"))
}

/// Run the opener's side of the `open` handshake on a fresh connection.
///
/// We are `me`, and expect to find `peer` at the other end.
pub(crate) async fn open_handshake(
    stream: &mut TcpStream,
    me: AgentId,
    peer: AgentId,
    timeout: Duration,
) -> Result<()> {
    let codec = ChannelCodec::new();
    let open = Open::new(me, peer);
    write_cell(stream, &codec, ChanCell::new(CircId::CHANNEL, AnyChanMsg::Open(open)))
        .await
        .map_err(|e| match e {
            Error::ChanIoErr(e) => Error::HandshakeIoErr(e),
            e => e,
        })?;
    let reply = read_cell(stream, &codec, timeout, "opened cell").await?;
    match reply.msg() {
        AnyChanMsg::Opened(o) if *o == open => Ok(()),
        AnyChanMsg::Opened(_) => Err(Error::ChanProto("opened cell doesn't echo our open".into())),
        AnyChanMsg::OpenFailed(_) => Err(Error::OpenRefused(peer)),
        other => Err(Error::ChanProto(format!(
            "expected opened, got {} cell",
            other.cmd()
        ))),
    }
}

/// An opened link from an originator to a relay.
pub struct ClientChannel {
    /// The connection.
    stream: TcpStream,
    /// Codec for every cell we send and receive.
    codec: ChannelCodec,
    /// How long to wait for any one cell.
    timeout: Duration,
    /// Cells we read while waiting for an answer on some other circuit.
    backlog: VecDeque<ChanCell>,
}

impl ClientChannel {
    /// Connect to the relay at `addr`, which should be `peer_agent`, and
    /// open a link to it as `my_agent`.
    ///
    /// `timeout` bounds the connection attempt, and each later wait for a
    /// cell.
    pub async fn connect(
        addr: SocketAddr,
        my_agent: AgentId,
        peer_agent: AgentId,
        timeout: Duration,
    ) -> Result<Self> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout("relay connection"))?
            .map_err(|e| Error::HandshakeIoErr(Arc::new(e)))?;
        let _ = stream.set_nodelay(true);
        open_handshake(&mut stream, my_agent, peer_agent, timeout).await?;
        Ok(ClientChannel {
            stream,
            codec: ChannelCodec::new(),
            timeout,
            backlog: VecDeque::new(),
        })
    }

    /// Send an arbitrary cell.
    pub async fn send_cell(&mut self, cell: ChanCell) -> Result<()> {
        trace!("sending {} cell on circ {}", cell.msg().cmd(), cell.circid());
        write_cell(&mut self.stream, &self.codec, cell).await
    }

    /// Send a relay message on `circ_id`.
    async fn send_relay(&mut self, circ_id: CircId, stream_id: StreamId, msg: AnyRelayMsg) -> Result<()> {
        let cell = AnyChanMsg::Relay(RelayCell::new(stream_id, msg));
        self.send_cell(ChanCell::new(circ_id, cell)).await
    }

    /// Return the next cell from the relay, on any circuit.
    pub async fn recv_cell(&mut self) -> Result<ChanCell> {
        if let Some(cell) = self.backlog.pop_front() {
            return Ok(cell);
        }
        read_cell(&mut self.stream, &self.codec, self.timeout, "cell").await
    }

    /// Return the next cell from the relay on `circ_id`.
    ///
    /// Cells for other circuits are kept for [`recv_cell`](Self::recv_cell).
    async fn recv_on(&mut self, circ_id: CircId, waiting_for: &'static str) -> Result<ChanCell> {
        if let Some(pos) = self.backlog.iter().position(|c| c.circid() == circ_id) {
            if let Some(cell) = self.backlog.remove(pos) {
                return Ok(cell);
            }
        }
        loop {
            let cell = read_cell(&mut self.stream, &self.codec, self.timeout, waiting_for).await?;
            if cell.circid() == circ_id {
                return Ok(cell);
            }
            self.backlog.push_back(cell);
        }
    }

    /// Create a circuit with ID `circ_id` at the relay.
    pub async fn create(&mut self, circ_id: CircId) -> Result<()> {
        self.send_cell(ChanCell::new(circ_id, AnyChanMsg::Create))
            .await?;
        let reply = self.recv_on(circ_id, "created cell").await?;
        match reply.msg() {
            AnyChanMsg::Created => Ok(()),
            AnyChanMsg::CreateFailed => Err(Error::CreateRefused),
            AnyChanMsg::Destroy => Err(Error::CircuitClosed),
            other => Err(Error::CircProto(format!(
                "expected created, got {} cell",
                other.cmd()
            ))),
        }
    }

    /// Wait for a relay message on `circ_id`.
    ///
    /// A `destroy` instead is an error.
    async fn recv_relay(&mut self, circ_id: CircId, waiting_for: &'static str) -> Result<RelayCell> {
        let reply = self.recv_on(circ_id, waiting_for).await?;
        match reply.into_circid_and_msg().1 {
            AnyChanMsg::Relay(cell) => Ok(cell),
            AnyChanMsg::Destroy => Err(Error::CircuitClosed),
            other => Err(Error::CircProto(format!(
                "expected relay, got {} cell",
                other.cmd()
            ))),
        }
    }

    /// Extend the circuit `circ_id` to the relay `agent` at `target`.
    pub async fn extend(&mut self, circ_id: CircId, target: StreamTarget, agent: AgentId) -> Result<()> {
        let msg = AnyRelayMsg::Extend(Extend::new(target, agent));
        self.send_relay(circ_id, StreamId::default(), msg).await?;
        let reply = self.recv_relay(circ_id, "extended cell").await?;
        match reply.msg() {
            AnyRelayMsg::Extended => Ok(()),
            AnyRelayMsg::ExtendFailed => Err(Error::ExtendRefused),
            other => Err(Error::CircProto(format!(
                "expected extended, got {}",
                other.cmd()
            ))),
        }
    }

    /// Open a stream to `target` at the last hop of `circ_id`.
    ///
    /// Return the stream ID the last hop chose.
    pub async fn begin(&mut self, circ_id: CircId, target: StreamTarget) -> Result<StreamId> {
        let msg = AnyRelayMsg::Begin(Begin::new(target));
        self.send_relay(circ_id, StreamId::default(), msg).await?;
        let reply = self.recv_relay(circ_id, "connected cell").await?;
        match reply.msg() {
            AnyRelayMsg::Connected => Ok(reply.stream_id()),
            AnyRelayMsg::BeginFailed => Err(Error::BeginRefused),
            other => Err(Error::CircProto(format!(
                "expected connected, got {}",
                other.cmd()
            ))),
        }
    }

    /// Send `data` on a stream, in as many cells as it takes.
    pub async fn send_data(&mut self, circ_id: CircId, stream_id: StreamId, mut data: &[u8]) -> Result<()> {
        while let Some((cell, rest)) = Data::split_from(data) {
            self.send_relay(circ_id, stream_id, AnyRelayMsg::Data(cell))
                .await?;
            data = rest;
        }
        Ok(())
    }

    /// End a stream.
    pub async fn end_stream(&mut self, circ_id: CircId, stream_id: StreamId) -> Result<()> {
        self.send_relay(circ_id, stream_id, AnyRelayMsg::End).await
    }

    /// Destroy a circuit.
    pub async fn destroy(&mut self, circ_id: CircId) -> Result<()> {
        self.send_cell(ChanCell::new(circ_id, AnyChanMsg::Destroy))
            .await
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| Error::ChanIoErr(Arc::new(e)))
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("backlog", &self.backlog.len())
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
    use tokio::net::TcpListener;

    /// Accept one connection, answer its open with `reply`, and return it.
    async fn fake_relay(reply: fn(Open) -> AnyChanMsg) -> (SocketAddr, tokio::task::JoinHandle<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let codec = ChannelCodec::new();
            let cell = read_cell(&mut sock, &codec, Duration::from_secs(5), "open")
                .await
                .unwrap();
            let AnyChanMsg::Open(open) = cell.msg() else {
                panic!("{:?}", cell);
            };
            write_cell(&mut sock, &codec, ChanCell::new(CircId::CHANNEL, reply(*open)))
                .await
                .unwrap();
            sock
        });
        (addr, task)
    }

    #[tokio::test]
    async fn open_refused() {
        let (addr, _task) = fake_relay(AnyChanMsg::OpenFailed).await;
        let err = ClientChannel::connect(addr, 1_u32.into(), 2_u32.into(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OpenRefused(a) if a == 2_u32.into()));
    }

    #[tokio::test]
    async fn backlog_kept() {
        let (addr, task) = fake_relay(AnyChanMsg::Opened).await;
        let mut chan = ClientChannel::connect(addr, 1_u32.into(), 2_u32.into(), Duration::from_secs(5))
            .await
            .unwrap();
        let mut sock = task.await.unwrap();
        let codec = ChannelCodec::new();

        // Answer circuit 7 after a stray cell on circuit 9.
        write_cell(&mut sock, &codec, ChanCell::new(CircId::new(9), AnyChanMsg::Destroy))
            .await
            .unwrap();
        write_cell(&mut sock, &codec, ChanCell::new(CircId::new(7), AnyChanMsg::Created))
            .await
            .unwrap();
        chan.create(CircId::new(7)).await.unwrap();

        let stray = chan.recv_cell().await.unwrap();
        assert_eq!(stray.circid(), CircId::new(9));
        assert!(matches!(stray.msg(), AnyChanMsg::Destroy));

        // What the relay saw: our create.
        let cell = read_cell(&mut sock, &codec, Duration::from_secs(5), "create")
            .await
            .unwrap();
        assert!(matches!(cell.msg(), AnyChanMsg::Create));
    }

    #[tokio::test]
    async fn data_is_chunked() {
        let (addr, task) = fake_relay(AnyChanMsg::Opened).await;
        let mut chan = ClientChannel::connect(addr, 1_u32.into(), 2_u32.into(), Duration::from_secs(5))
            .await
            .unwrap();
        let mut sock = task.await.unwrap();
        let codec = ChannelCodec::new();

        let payload = vec![0x41_u8; Data::MAXLEN + 10];
        chan.send_data(CircId::new(3), StreamId::from(4), &payload)
            .await
            .unwrap();
        let mut lens = vec![];
        for _ in 0..2 {
            let cell = read_cell(&mut sock, &codec, Duration::from_secs(5), "data")
                .await
                .unwrap();
            match cell.msg() {
                AnyChanMsg::Relay(r) => match r.msg() {
                    AnyRelayMsg::Data(d) => lens.push(d.as_ref().len()),
                    other => panic!("{:?}", other),
                },
                other => panic!("{:?}", other),
            }
        }
        assert_eq!(lens, vec![Data::MAXLEN, 10]);
    }
}
