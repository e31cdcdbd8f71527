//! Circuits through relays on loopback: streams, extends, and teardown.

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

use std::net::SocketAddr;
use std::time::Duration;

use onion_cell::chancell::codec::ChannelCodec;
use onion_cell::chancell::msg::AnyChanMsg;
use onion_cell::chancell::{AgentId, ChanCell, CircId, RawCell, CELL_LEN};
use onion_cell::relaycell::msg::{AnyRelayMsg, StreamTarget};
use onion_cell::relaycell::StreamId;
use onion_relay::client::ClientChannel;
use onion_relay::config::Listen;
use onion_relay::{Error, OnionRelay, RelayConfig, RelayHandle, RelayStats};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// What the originator sends to the destination.
const REQUEST: &[u8] = b"GET / HTTP/1.0\r\nHost: example\r\n\r\n";

/// How long any one step may take.
const STEP: Duration = Duration::from_secs(5);

/// Start a relay with agent ID `agent` on an ephemeral loopback port.
async fn launch(agent: u32) -> RelayHandle {
    launch_idle(agent, Duration::from_secs(600)).await
}

/// Like [`launch`], but close links that send nothing for `idle_timeout`.
async fn launch_idle(agent: u32, idle_timeout: Duration) -> RelayHandle {
    let mut bld = RelayConfig::builder();
    bld.relay()
        .agent_id(agent)
        .listen(Listen::loopback_ephemeral());
    bld.channel()
        .connect_timeout(Duration::from_secs(2))
        .handshake_timeout(Duration::from_secs(2))
        .idle_timeout(idle_timeout);
    let config = bld.build().unwrap();
    OnionRelay::bind(config).await.unwrap().launch().unwrap()
}

/// Return the address of `relay` as a stream target.
fn relay_target(relay: &RelayHandle) -> StreamTarget {
    target(relay.local_addrs()[0])
}

/// Return `addr` as a stream target.
fn target(addr: SocketAddr) -> StreamTarget {
    StreamTarget::new(addr.ip().to_string(), addr.port()).unwrap()
}

/// Open a link to `relay` as agent `me`.
async fn connect(relay: &RelayHandle, me: u32) -> ClientChannel {
    ClientChannel::connect(relay.local_addrs()[0], me.into(), relay.agent_id(), STEP)
        .await
        .unwrap()
}

/// A response longer than one data cell.
fn response() -> Vec<u8> {
    (0..1200_u32).map(|i| (i % 251) as u8).collect()
}

/// Start a destination that reads [`REQUEST`], answers with [`response`],
/// and hangs up.
///
/// The task returns what it read.
async fn destination() -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut req = vec![0_u8; REQUEST.len()];
        sock.read_exact(&mut req).await.unwrap();
        sock.write_all(&response()).await.unwrap();
        req
    });
    (addr, task)
}

/// Read `stream` on `circ` until the relay ends it; return the bytes.
async fn read_to_end(chan: &mut ClientChannel, circ: CircId, stream: StreamId) -> Vec<u8> {
    let mut body = vec![];
    loop {
        let cell = chan.recv_cell().await.unwrap();
        assert_eq!(cell.circid(), circ);
        let AnyChanMsg::Relay(relay) = cell.msg() else {
            panic!("unexpected {:?}", cell);
        };
        assert_eq!(relay.stream_id(), stream);
        match relay.msg() {
            AnyRelayMsg::Data(d) => body.extend_from_slice(d.as_ref()),
            AnyRelayMsg::End => return body,
            other => panic!("unexpected {:?}", other),
        }
    }
}

/// Wait until `pred` holds for the stats of `relay`.
async fn wait_for(relay: &RelayHandle, pred: impl Fn(RelayStats) -> bool) {
    tokio::time::timeout(STEP, async {
        while !pred(relay.stats()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("stats never settled: {:?}", relay.stats()));
}

/// What a [`fake_hop`] does after saying `created`.
#[derive(Debug, Clone, Copy)]
enum AfterCreated {
    /// Keep reading.
    Listen,
    /// Close the link at once.
    HangUp,
    /// Wait this long, send one `destroy` for a circuit that doesn't exist,
    /// and keep reading.
    Ping(Duration),
}

/// Accept one link as agent `agent`, say `created` to each create, and
/// return every cell read after the handshake until the link closes.
async fn fake_hop(agent: u32, after: AfterCreated) -> (SocketAddr, JoinHandle<Vec<ChanCell>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let codec = ChannelCodec::new();
        let open = read_raw(&mut sock, &codec).await.unwrap();
        let AnyChanMsg::Open(body) = open.msg() else {
            panic!("unexpected {:?}", open);
        };
        assert_eq!(body.opened(), AgentId::from(agent));
        let reply = ChanCell::new(CircId::CHANNEL, AnyChanMsg::Opened(*body));
        sock.write_all(&codec.encode(reply).unwrap()).await.unwrap();

        let mut cells = vec![];
        while let Some(cell) = read_raw(&mut sock, &codec).await {
            let create = matches!(cell.msg(), AnyChanMsg::Create);
            if create {
                let reply = ChanCell::new(cell.circid(), AnyChanMsg::Created);
                sock.write_all(&codec.encode(reply).unwrap()).await.unwrap();
            }
            cells.push(cell);
            match after {
                AfterCreated::HangUp if create => break,
                AfterCreated::Ping(delay) if create => {
                    tokio::time::sleep(delay).await;
                    let ping = ChanCell::new(CircId::new(1), AnyChanMsg::Destroy);
                    sock.write_all(&codec.encode(ping).unwrap()).await.unwrap();
                }
                _ => {}
            }
        }
        cells
    });
    (addr, task)
}

/// Read one cell, or `None` at end of stream.
async fn read_raw(sock: &mut TcpStream, codec: &ChannelCodec) -> Option<ChanCell> {
    let mut raw: RawCell = [0_u8; CELL_LEN];
    match tokio::time::timeout(STEP, sock.read_exact(&mut raw)).await.unwrap() {
        Ok(_) => Some(codec.decode(&raw).unwrap()),
        Err(_) => None,
    }
}

#[tokio::test]
async fn open_wrong_agent() {
    let relay = launch(30).await;
    let err = ClientChannel::connect(relay.local_addrs()[0], 1_u32.into(), 31_u32.into(), STEP)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OpenRefused(_)));
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn begin_data_end() {
    let relay = launch(30).await;
    let (dest, server) = destination().await;

    let mut chan = connect(&relay, 1).await;
    let circ = CircId::new(5);
    chan.create(circ).await.unwrap();
    let stream = chan.begin(circ, target(dest)).await.unwrap();
    assert!(!stream.is_zero());
    chan.send_data(circ, stream, REQUEST).await.unwrap();

    // The destination hanging up ends the stream.
    assert_eq!(read_to_end(&mut chan, circ, stream).await, response());
    assert_eq!(server.await.unwrap(), REQUEST);
    wait_for(&relay, |s| s.streams == 0).await;

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn begin_unreachable() {
    let relay = launch(30).await;
    // Nobody listens here once the listener is gone.
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };

    let mut chan = connect(&relay, 1).await;
    let circ = CircId::new(5);
    chan.create(circ).await.unwrap();
    let err = chan.begin(circ, target(dead)).await.unwrap_err();
    assert!(matches!(err, Error::BeginRefused));
    // The circuit is still unresolved, so a second begin may succeed.
    let (dest, _server) = destination().await;
    chan.begin(circ, target(dest)).await.unwrap();

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn end_closes_destination() {
    let relay = launch(30).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest = listener.local_addr().unwrap();

    let mut chan = connect(&relay, 1).await;
    let circ = CircId::new(9);
    chan.create(circ).await.unwrap();
    let stream = chan.begin(circ, target(dest)).await.unwrap();
    let (mut dsock, _) = listener.accept().await.unwrap();
    assert_eq!(relay.stats().streams, 1);

    chan.end_stream(circ, stream).await.unwrap();
    let mut buf = [0_u8; 16];
    let n = tokio::time::timeout(STEP, dsock.read(&mut buf)).await.unwrap();
    assert!(matches!(n, Ok(0) | Err(_)));
    wait_for(&relay, |s| s.streams == 0).await;

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_create() {
    let relay = launch(30).await;
    let mut chan = connect(&relay, 1).await;
    let circ = CircId::new(11);

    for _ in 0..2 {
        chan.send_cell(ChanCell::new(circ, AnyChanMsg::Create))
            .await
            .unwrap();
    }
    let mut created = 0;
    let mut failed = 0;
    for _ in 0..2 {
        let cell = chan.recv_cell().await.unwrap();
        assert_eq!(cell.circid(), circ);
        match cell.msg() {
            AnyChanMsg::Created => created += 1,
            AnyChanMsg::CreateFailed => failed += 1,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!((created, failed), (1, 1));
    assert_eq!(relay.stats().circuits, 1);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn destroy_twice() {
    let relay = launch(30).await;
    let mut chan = connect(&relay, 1).await;
    let circ = CircId::new(5);

    chan.create(circ).await.unwrap();
    chan.destroy(circ).await.unwrap();
    chan.destroy(circ).await.unwrap();
    // The ID is free again.
    chan.create(circ).await.unwrap();
    assert_eq!(relay.stats().circuits, 1);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn three_hops() {
    let a = launch(10).await;
    let b = launch(20).await;
    let c = launch(30).await;
    let (dest, server) = destination().await;

    let mut chan = connect(&a, 1).await;
    let circ = CircId::new(7);
    chan.create(circ).await.unwrap();
    chan.extend(circ, relay_target(&b), b.agent_id())
        .await
        .unwrap();
    // Both directions are routed.
    assert_eq!(a.stats().routes, 2);
    assert_eq!(a.stats().links, 2);

    // This one passes through `a`, and `b` does the work.
    chan.extend(circ, relay_target(&c), c.agent_id())
        .await
        .unwrap();
    assert_eq!(b.stats().routes, 2);

    let stream = chan.begin(circ, target(dest)).await.unwrap();
    // The exit, and the way back from it.
    assert_eq!(c.stats().routes, 2);
    chan.send_data(circ, stream, REQUEST).await.unwrap();
    assert_eq!(read_to_end(&mut chan, circ, stream).await, response());
    assert_eq!(server.await.unwrap(), REQUEST);

    // Destroying the circuit clears it from every hop.
    chan.destroy(circ).await.unwrap();
    for relay in [&a, &b, &c] {
        wait_for(relay, |s| s.circuits == 0).await;
    }

    for relay in [a, b, c] {
        relay.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn extend_refused() {
    let a = launch(10).await;
    let b = launch(20).await;

    let mut chan = connect(&a, 1).await;
    let circ = CircId::new(7);
    chan.create(circ).await.unwrap();
    // `b` won't answer to the wrong agent ID.
    let err = chan
        .extend(circ, relay_target(&b), 21_u32.into())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExtendRefused));
    // The circuit is unresolved again, and can be extended properly.
    chan.extend(circ, relay_target(&b), b.agent_id())
        .await
        .unwrap();

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn extend_reuses_link() {
    let a = launch(10).await;
    let b = launch(20).await;

    let mut chan = connect(&a, 1).await;
    let circs = [CircId::new(7), CircId::new(8)];
    for circ in circs {
        chan.create(circ).await.unwrap();
        chan.extend(circ, relay_target(&b), b.agent_id())
            .await
            .unwrap();
    }
    // One link from us, one to `b`; `b` only ever heard from `a` once.
    assert_eq!(a.stats().links, 2);
    assert_eq!(a.stats().routes, 4);
    assert_eq!(b.stats().links, 1);
    assert_eq!(b.stats().circuits, 2);

    // Both circuits work over the shared link.
    for circ in circs {
        let (dest, server) = destination().await;
        let stream = chan.begin(circ, target(dest)).await.unwrap();
        chan.send_data(circ, stream, REQUEST).await.unwrap();
        assert_eq!(read_to_end(&mut chan, circ, stream).await, response());
        assert_eq!(server.await.unwrap(), REQUEST);
    }

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn next_hop_hangs_up_after_created() {
    let a = launch(10).await;
    let b = launch(20).await;
    let (hop, hop_task) = fake_hop(30, AfterCreated::HangUp).await;

    let mut chan = connect(&a, 1).await;
    let circ = CircId::new(3);
    chan.create(circ).await.unwrap();
    // Whichever way the race goes, we get an answer.
    match chan.extend(circ, target(hop), 30_u32.into()).await {
        Err(Error::ExtendRefused) => {
            // Unresolved again, so it can go elsewhere.
            chan.extend(circ, relay_target(&b), b.agent_id())
                .await
                .unwrap();
            assert_eq!(a.stats().routes, 2);
        }
        Ok(()) => {
            let cell = chan.recv_cell().await.unwrap();
            assert_eq!(cell.circid(), circ);
            assert!(matches!(cell.msg(), AnyChanMsg::Destroy));
            wait_for(&a, |s| s.circuits == 0).await;
        }
        Err(Error::CircuitClosed) => wait_for(&a, |s| s.circuits == 0).await,
        Err(e) => panic!("unexpected {:?}", e),
    }
    assert_eq!(hop_task.await.unwrap().len(), 1);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn idle_link_is_torn_down() {
    let a = launch_idle(10, Duration::from_secs(1)).await;
    // The hop stays busy for a while after the originator goes quiet.
    let (hop, hop_task) = fake_hop(20, AfterCreated::Ping(Duration::from_millis(400))).await;

    let mut chan = connect(&a, 1).await;
    let circ = CircId::new(3);
    chan.create(circ).await.unwrap();
    chan.extend(circ, target(hop), 20_u32.into()).await.unwrap();
    assert_eq!(a.stats().routes, 2);

    // Say nothing more.  The relay drops our link, destroys the onward
    // circuit, and later drops the hop's link as well.
    assert!(chan.recv_cell().await.is_err());
    wait_for(&a, |s| s.circuits == 0 && s.links == 0).await;

    let cells = hop_task.await.unwrap();
    let [create, destroy] = &cells[..] else {
        panic!("unexpected cells {:?}", cells);
    };
    assert!(matches!(create.msg(), AnyChanMsg::Create));
    assert!(matches!(destroy.msg(), AnyChanMsg::Destroy));
    assert_eq!(create.circid(), destroy.circid());

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn closing_link_destroys_onward_circuit() {
    let a = launch(10).await;
    let (hop, hop_task) = fake_hop(20, AfterCreated::Listen).await;

    let mut chan = connect(&a, 1).await;
    let circ = CircId::new(3);
    chan.create(circ).await.unwrap();
    chan.extend(circ, target(hop), 20_u32.into()).await.unwrap();
    assert_eq!(a.stats().routes, 2);

    chan.close().await.unwrap();
    wait_for(&a, |s| s.circuits == 0).await;
    // The link to the next hop outlives the circuit; stopping the relay
    // closes it.
    a.shutdown().await.unwrap();

    let cells = hop_task.await.unwrap();
    let [create, destroy] = &cells[..] else {
        panic!("unexpected cells {:?}", cells);
    };
    assert!(matches!(create.msg(), AnyChanMsg::Create));
    assert!(matches!(destroy.msg(), AnyChanMsg::Destroy));
    assert_eq!(create.circid(), destroy.circid());
    // Chosen from the high half, since the relay opened this link.
    assert!(create.circid().get() & 0x8000 != 0);
}
