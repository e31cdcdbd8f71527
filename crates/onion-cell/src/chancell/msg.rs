//! Different kinds of messages that can be encoded in channel cells.

use super::{AgentId, ChanCmd};
use crate::relaycell::RelayCell;
use crate::{Error, Result};
use tor_bytes::{EncodeResult, Readable, Reader, Writer};

/// Decoded message from a channel.
///
/// Most of these messages have no body at all: their meaning is carried
/// entirely by the command and the circuit ID of the cell.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum AnyChanMsg {
    /// Ask a relay to accept this channel.
    Open(Open),
    /// Answer to an `Open`: the channel is usable.
    Opened(Open),
    /// Answer to an `Open`: the channel was refused.
    OpenFailed(Open),
    /// Create a new circuit with the cell's circuit ID.
    Create,
    /// Answer to a `Create`: the circuit exists.
    Created,
    /// Answer to a `Create`: the circuit ID was unusable.
    CreateFailed,
    /// Tear down a circuit.
    Destroy,
    /// A message sent along a circuit.
    Relay(RelayCell),
}

impl AnyChanMsg {
    /// Return the [`ChanCmd`] for this message.
    pub fn cmd(&self) -> ChanCmd {
        match self {
            AnyChanMsg::Open(_) => ChanCmd::OPEN,
            AnyChanMsg::Opened(_) => ChanCmd::OPENED,
            AnyChanMsg::OpenFailed(_) => ChanCmd::OPEN_FAILED,
            AnyChanMsg::Create => ChanCmd::CREATE,
            AnyChanMsg::Created => ChanCmd::CREATED,
            AnyChanMsg::CreateFailed => ChanCmd::CREATE_FAILED,
            AnyChanMsg::Destroy => ChanCmd::DESTROY,
            AnyChanMsg::Relay(_) => ChanCmd::RELAY,
        }
    }

    /// Write the body of this message (not including circuit ID or
    /// command).
    ///
    /// Does not pad to the cell length.
    pub fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        match self {
            AnyChanMsg::Open(o) | AnyChanMsg::Opened(o) | AnyChanMsg::OpenFailed(o) => {
                o.encode_onto(w);
                Ok(())
            }
            AnyChanMsg::Create
            | AnyChanMsg::Created
            | AnyChanMsg::CreateFailed
            | AnyChanMsg::Destroy => Ok(()),
            AnyChanMsg::Relay(r) => r.encode_onto(w),
        }
    }

    /// Decode this message from a given reader, according to a specified
    /// command value.
    ///
    /// Trailing padding is left in the reader.
    pub fn decode_from_reader(cmd: ChanCmd, r: &mut Reader<'_>) -> Result<Self> {
        let open = |r: &mut Reader<'_>| {
            r.extract::<Open>().map_err(|err| Error::BytesErr {
                err,
                parsed: "open body",
            })
        };
        Ok(match cmd {
            ChanCmd::OPEN => AnyChanMsg::Open(open(r)?),
            ChanCmd::OPENED => AnyChanMsg::Opened(open(r)?),
            ChanCmd::OPEN_FAILED => AnyChanMsg::OpenFailed(open(r)?),
            ChanCmd::CREATE => AnyChanMsg::Create,
            ChanCmd::CREATED => AnyChanMsg::Created,
            ChanCmd::CREATE_FAILED => AnyChanMsg::CreateFailed,
            ChanCmd::DESTROY => AnyChanMsg::Destroy,
            ChanCmd::RELAY => AnyChanMsg::Relay(RelayCell::decode_from_reader(r)?),
            _ => {
                return Err(Error::ChanProto(format!(
                    "Unrecognized channel command {}",
                    cmd
                )))
            }
        })
    }
}

/// The body of an `open` cell and of both of its replies.
///
/// The replies echo the body of the `open` they answer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Open {
    /// The agent that is opening the channel.
    opener: AgentId,
    /// The agent that the opener expects to find at the other end.
    opened: AgentId,
}

impl Open {
    /// Create a new open message body.
    pub fn new(opener: AgentId, opened: AgentId) -> Self {
        Open { opener, opened }
    }
    /// Return the agent that is opening the channel.
    pub fn opener(&self) -> AgentId {
        self.opener
    }
    /// Return the agent the opener expects at the far end.
    pub fn opened(&self) -> AgentId {
        self.opened
    }
    /// Write this body onto `w`.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) {
        w.write_u32(self.opener.into());
        w.write_u32(self.opened.into());
    }
}

impl Readable for Open {
    fn take_from(r: &mut Reader<'_>) -> tor_bytes::Result<Self> {
        let opener = r.take_u32()?.into();
        let opened = r.take_u32()?.into();
        Ok(Open { opener, opened })
    }
}
