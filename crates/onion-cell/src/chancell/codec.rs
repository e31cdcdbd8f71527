//! Implementation for encoding and decoding of ChanCells.

use super::{msg::AnyChanMsg, ChanCell, ChanCmd, CircId, RawCell, CELL_LEN};
use crate::Error;
use tor_bytes::{self, Reader, Writer};
use tor_error::internal;

/// This object can be used to encode and decode channel cells.
///
/// Every cell has the same layout:
///
/// ```ignore
///     u16 circid;
///     u8 command;
///     u8 body[509];
/// ```
///
/// Bodies shorter than 509 bytes are padded with zeros.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct ChannelCodec {}

impl ChannelCodec {
    /// Create a new ChannelCodec.
    pub fn new() -> Self {
        ChannelCodec {}
    }

    /// Encode `item` as a full, padded cell.
    pub fn encode(&self, item: ChanCell) -> crate::Result<RawCell> {
        let (circid, msg) = item.into_circid_and_msg();
        let cmd = msg.cmd();
        let mut buf: Vec<u8> = Vec::with_capacity(CELL_LEN);
        buf.write_u16(circid.into());
        buf.write_u8(cmd.into());
        msg.encode_onto(&mut buf)?;
        if buf.len() > CELL_LEN {
            return Err(Error::Internal(internal!("ran out of space for cell")));
        }
        let mut raw = [0_u8; CELL_LEN];
        raw[..buf.len()].copy_from_slice(&buf[..]);
        Ok(raw)
    }

    /// Decode a single cell.
    ///
    /// Fails on an unknown command, a malformed body, or a circuit ID that
    /// doesn't suit the command.
    pub fn decode(&self, raw: &RawCell) -> crate::Result<ChanCell> {
        /// Wrap `be` as an appropriate type.
        fn wrap_err(be: tor_bytes::Error) -> crate::Error {
            crate::Error::BytesErr {
                err: be,
                parsed: "channel cell",
            }
        }

        let mut r = Reader::from_slice(&raw[..]);
        let circid: CircId = r.take_u16().map_err(wrap_err)?.into();
        let cmd: ChanCmd = r.take_u8().map_err(wrap_err)?.into();
        let msg = AnyChanMsg::decode_from_reader(cmd, &mut r)?;

        if cmd.is_channel_level() != circid.is_channel() {
            return Err(Error::ChanProto(format!(
                "Invalid circuit ID {} for cell command {}",
                circid, cmd
            )));
        }
        Ok(ChanCell::new(circid, msg))
    }
}

/// Return the circuit ID of an encoded cell.
pub fn circ_id_of(raw: &RawCell) -> CircId {
    u16::from_be_bytes([raw[0], raw[1]]).into()
}

/// Replace the circuit ID of an encoded cell, leaving the rest untouched.
pub fn set_circ_id(raw: &mut RawCell, circid: CircId) {
    raw[..2].copy_from_slice(&u16::from(circid).to_be_bytes());
}

/// Return the command byte of an encoded cell.
pub fn cmd_of(raw: &RawCell) -> ChanCmd {
    raw[2].into()
}
