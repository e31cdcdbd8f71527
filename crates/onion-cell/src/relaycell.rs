//! Implementation for parsing and encoding relay cells

use crate::chancell::CELL_DATA_LEN;
use crate::{Error, Result};
use tor_bytes::{EncodeError, EncodeResult, Reader, Writer};

use caret::caret_int;

pub mod msg;

/// The length of the relay header, which follows the channel cell header in
/// every relay cell.
pub const RELAY_HEADER_LEN: usize = 11;

/// The largest body a single relay cell can carry.
pub const RELAY_BODY_MAX: usize = CELL_DATA_LEN - RELAY_HEADER_LEN;

caret_int! {
    /// A command that identifies the type of a relay cell
    pub struct RelayCmd(u8) {
        /// Start a new stream
        BEGIN = 1,
        /// Data on a stream
        DATA = 2,
        /// Close a stream
        END = 3,
        /// Acknowledge a BEGIN; stream is open
        CONNECTED = 4,
        /// Extend a circuit to a new hop
        EXTEND = 6,
        /// Reply to EXTEND: the circuit is one hop longer
        EXTENDED = 7,
        /// Reply to BEGIN: the stream could not be opened
        BEGIN_FAILED = 11,
        /// Reply to EXTEND: the circuit could not be extended
        EXTEND_FAILED = 12,
    }
}

/// Identify a single stream on a circuit.
///
/// Zero means "no particular stream", and is used for messages that
/// concern the circuit as a whole, and for a `begin` whose stream ID is
/// chosen by the relay that answers it.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Default)]
pub struct StreamId(u16);

impl From<u16> for StreamId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}
impl From<StreamId> for u16 {
    fn from(id: StreamId) -> u16 {
        id.0
    }
}
impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl StreamId {
    /// Return true if this is the zero stream ID.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// A relay cell: a stream ID and a relay message, carried in the body of a
/// `relay` channel cell.
#[derive(Clone, Debug)]
pub struct RelayCell {
    /// The stream ID for the stream that this cell corresponds to.
    streamid: StreamId,
    /// The relay message for this cell.
    msg: msg::AnyRelayMsg,
}

impl RelayCell {
    /// Construct a new relay cell.
    pub fn new(streamid: StreamId, msg: msg::AnyRelayMsg) -> Self {
        RelayCell { streamid, msg }
    }
    /// Return the stream ID for this cell.
    pub fn stream_id(&self) -> StreamId {
        self.streamid
    }
    /// Return the underlying message for this cell.
    pub fn msg(&self) -> &msg::AnyRelayMsg {
        &self.msg
    }
    /// Return the command for this cell.
    pub fn cmd(&self) -> RelayCmd {
        self.msg.cmd()
    }
    /// Consume this cell and return its components.
    pub fn into_streamid_and_msg(self) -> (StreamId, msg::AnyRelayMsg) {
        (self.streamid, self.msg)
    }

    /// Decode a relay cell from the body of a `relay` channel cell.
    ///
    /// Trailing padding is left in the reader.
    pub(crate) fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let bytes_err = |err| Error::BytesErr {
            err,
            parsed: "relay header",
        };
        let streamid = r.take_u16().map_err(bytes_err)?.into();
        let _recognized = r.take_u16().map_err(bytes_err)?;
        let _digest = r.take_u32().map_err(bytes_err)?;
        let len = r.take_u16().map_err(bytes_err)? as usize;
        let cmd: RelayCmd = r.take_u8().map_err(bytes_err)?.into();
        if len > RELAY_BODY_MAX {
            return Err(Error::RelayProto(format!(
                "Relay body length {} exceeds {}",
                len, RELAY_BODY_MAX
            )));
        }
        let body = r.take(len).map_err(bytes_err)?;
        let msg = msg::AnyRelayMsg::decode_from_body(cmd, body)?;
        Ok(RelayCell { streamid, msg })
    }

    /// Encode this relay cell (header and body, no padding) onto `w`.
    pub(crate) fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        let cmd = self.msg.cmd();
        let mut body: Vec<u8> = Vec::new();
        self.msg.encode_onto(&mut body)?;
        if body.len() > RELAY_BODY_MAX {
            return Err(EncodeError::BadLengthValue);
        }
        w.write_u16(self.streamid.into());
        // "recognized" and "digest" are unused without onion encryption.
        w.write_u16(0);
        w.write_u32(0);
        w.write_u16(body.len() as u16);
        w.write_u8(cmd.into());
        w.write_all(&body[..]);
        Ok(())
    }
}

