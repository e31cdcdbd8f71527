//! Encoding and decoding for relay messages
//!
//! Relay messages are sent along circuits, inside `relay` channel cells.

use super::{RelayCmd, RELAY_BODY_MAX};
use crate::chancell::AgentId;
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use tor_bytes::{EncodeResult, Reader, Writer};

/// A single parsed relay message, sent or received along a circuit
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum AnyRelayMsg {
    /// Create a stream to a destination
    Begin(Begin),
    /// Send data on a stream
    Data(Data),
    /// Close a stream
    End,
    /// Successful response to a Begin message
    Connected,
    /// Extend a circuit to a new hop
    Extend(Extend),
    /// Successful response to an Extend message
    Extended,
    /// Failure response to a Begin message
    BeginFailed,
    /// Failure response to an Extend message
    ExtendFailed,
    /// A message whose sub-command we don't know.
    ///
    /// Kept around so that an intermediate hop can pass it along.
    Unrecognized(Unrecognized),
}

impl AnyRelayMsg {
    /// Return the [`RelayCmd`] for this message.
    pub fn cmd(&self) -> RelayCmd {
        match self {
            AnyRelayMsg::Begin(_) => RelayCmd::BEGIN,
            AnyRelayMsg::Data(_) => RelayCmd::DATA,
            AnyRelayMsg::End => RelayCmd::END,
            AnyRelayMsg::Connected => RelayCmd::CONNECTED,
            AnyRelayMsg::Extend(_) => RelayCmd::EXTEND,
            AnyRelayMsg::Extended => RelayCmd::EXTENDED,
            AnyRelayMsg::BeginFailed => RelayCmd::BEGIN_FAILED,
            AnyRelayMsg::ExtendFailed => RelayCmd::EXTEND_FAILED,
            AnyRelayMsg::Unrecognized(u) => u.cmd(),
        }
    }

    /// Write the body of this message onto `w`.
    pub(crate) fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        match self {
            AnyRelayMsg::Begin(b) => b.encode_onto(w),
            AnyRelayMsg::Data(d) => w.write_all(&d.body[..]),
            AnyRelayMsg::Extend(e) => e.encode_onto(w),
            AnyRelayMsg::Unrecognized(u) => w.write_all(&u.body[..]),
            AnyRelayMsg::End
            | AnyRelayMsg::Connected
            | AnyRelayMsg::Extended
            | AnyRelayMsg::BeginFailed
            | AnyRelayMsg::ExtendFailed => {}
        }
        Ok(())
    }

    /// Decode a message with command `cmd` from `body`, which holds exactly
    /// the body bytes announced by the relay header.
    pub(crate) fn decode_from_body(cmd: RelayCmd, body: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(body);
        Ok(match cmd {
            RelayCmd::BEGIN => AnyRelayMsg::Begin(Begin::decode_from_reader(&mut r)?),
            RelayCmd::DATA => AnyRelayMsg::Data(Data { body: body.into() }),
            RelayCmd::END => AnyRelayMsg::End,
            RelayCmd::CONNECTED => AnyRelayMsg::Connected,
            RelayCmd::EXTEND => AnyRelayMsg::Extend(Extend::decode_from_reader(&mut r)?),
            RelayCmd::EXTENDED => AnyRelayMsg::Extended,
            RelayCmd::BEGIN_FAILED => AnyRelayMsg::BeginFailed,
            RelayCmd::EXTEND_FAILED => AnyRelayMsg::ExtendFailed,
            _ => AnyRelayMsg::Unrecognized(Unrecognized {
                cmd,
                body: body.into(),
            }),
        })
    }
}

/// A `host:port` pair naming where a stream or a circuit extension
/// should go.
///
/// The host may be a DNS name or an IP address literal; it is not resolved
/// here.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    /// The host part.
    host: String,
    /// The port part.
    port: u16,
}

impl StreamTarget {
    /// Construct a new target.
    ///
    /// Fails if `host` is empty or contains a NUL byte.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() || host.contains('\0') {
            return Err(Error::BadStreamAddress);
        }
        Ok(StreamTarget { host, port })
    }
    /// Return the host part of this target.
    pub fn host(&self) -> &str {
        &self.host
    }
    /// Return the port part of this target.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Read a NUL-terminated `host:port` string.
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let bytes = r.take_until(0).map_err(|err| Error::BytesErr {
            err,
            parsed: "stream target",
        })?;
        std::str::from_utf8(bytes)
            .map_err(|_| Error::BadStreamAddress)?
            .parse()
    }

    /// Write this target as a NUL-terminated string.
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) {
        w.write_all(self.to_string().as_bytes());
        w.write_u8(0);
    }
}

impl FromStr for StreamTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or(Error::BadStreamAddress)?;
        let port = port.parse().map_err(|_| Error::BadStreamAddress)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        StreamTarget::new(host, port)
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A Begin message asks the last relay of a circuit to open a TCP stream
/// to a destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Begin {
    /// Where to connect.
    target: StreamTarget,
}

impl Begin {
    /// Construct a new Begin message.
    pub fn new(target: StreamTarget) -> Self {
        Begin { target }
    }
    /// Return the requested destination.
    pub fn target(&self) -> &StreamTarget {
        &self.target
    }
    /// Consume this message and return the requested destination.
    pub fn into_target(self) -> StreamTarget {
        self.target
    }
    /// Decode a Begin body.
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Begin {
            target: StreamTarget::decode_from_reader(r)?,
        })
    }
    /// Encode a Begin body.
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) {
        self.target.encode_onto(w);
    }
}

/// An Extend message asks the last relay of a circuit to build the
/// circuit one hop further, to the relay at `target` whose agent ID is
/// `agent`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extend {
    /// Network address of the next hop.
    target: StreamTarget,
    /// Agent ID the next hop is expected to have.
    agent: AgentId,
}

impl Extend {
    /// Construct a new Extend message.
    pub fn new(target: StreamTarget, agent: AgentId) -> Self {
        Extend { target, agent }
    }
    /// Return the address of the next hop.
    pub fn target(&self) -> &StreamTarget {
        &self.target
    }
    /// Return the agent ID of the next hop.
    pub fn agent(&self) -> AgentId {
        self.agent
    }
    /// Consume this message and return its components.
    pub fn into_parts(self) -> (StreamTarget, AgentId) {
        (self.target, self.agent)
    }
    /// Decode an Extend body.
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let target = StreamTarget::decode_from_reader(r)?;
        let agent = r
            .take_u32()
            .map_err(|err| Error::BytesErr {
                err,
                parsed: "extend agent ID",
            })?
            .into();
        Ok(Extend { target, agent })
    }
    /// Encode an Extend body.
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) {
        self.target.encode_onto(w);
        w.write_u32(self.agent.into());
    }
}

/// A Data message carries application bytes along a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data {
    /// The bytes, at most [`RELAY_BODY_MAX`] of them.
    body: Vec<u8>,
}

impl Data {
    /// The longest body a single Data message can hold.
    pub const MAXLEN: usize = RELAY_BODY_MAX;

    /// Construct a new Data message from `inp`.
    ///
    /// Fails if `inp` is empty or doesn't fit in one cell; see
    /// [`Data::split_from`] for a way to chunk longer input.
    pub fn new(inp: &[u8]) -> Result<Self> {
        if inp.is_empty() {
            return Err(Error::CantEncode("Empty data message"));
        }
        if inp.len() > Data::MAXLEN {
            return Err(Error::CantEncode("Data message too long"));
        }
        Ok(Data { body: inp.into() })
    }

    /// Construct a Data message from the longest prefix of `inp` that
    /// fits in one cell, and return it along with the unconsumed rest.
    ///
    /// Returns `None` if `inp` is empty.
    pub fn split_from(inp: &[u8]) -> Option<(Self, &[u8])> {
        if inp.is_empty() {
            return None;
        }
        let len = std::cmp::min(inp.len(), Data::MAXLEN);
        let (data, remainder) = inp.split_at(len);
        Some((Data { body: data.into() }, remainder))
    }

    /// Consume this message and return its body.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

impl AsRef<[u8]> for Data {
    fn as_ref(&self) -> &[u8] {
        &self.body[..]
    }
}

/// A relay message whose sub-command this crate doesn't know.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unrecognized {
    /// The sub-command from the relay header.
    cmd: RelayCmd,
    /// The raw body.
    body: Vec<u8>,
}

impl Unrecognized {
    /// Return the sub-command of this message.
    pub fn cmd(&self) -> RelayCmd {
        self.cmd
    }
    /// Return the raw body of this message.
    pub fn body(&self) -> &[u8] {
        &self.body[..]
    }
}
