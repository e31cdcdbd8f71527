//! Messages sent over channels
//!
//! A 'channel' is a direct TCP connection between an originator and a
//! relay, or between two relays.
//!
//! This module implements the [ChanCell] type, which is the unit of data
//! sent over a channel.  It also encodes and decodes the various channel
//! messages, which are the types of data conveyed over a channel.
pub mod codec;
pub mod msg;

use caret::caret_int;

/// The length of every cell on the wire.
pub const CELL_LEN: usize = 512;

/// The length of the part of a cell shared by all commands: the circuit ID
/// and the command byte.
pub const CELL_HEADER_LEN: usize = 3;

/// The amount of command-specific data in a cell.
pub const CELL_DATA_LEN: usize = CELL_LEN - CELL_HEADER_LEN;

/// A cell as it appears on the wire.
pub type RawCell = [u8; CELL_LEN];

/// Channel-local identifier for a circuit.
///
/// Circuit IDs are chosen by whoever sends the `create` cell, and are only
/// unique on a single channel: the same number on two channels names two
/// unrelated circuits.
///
/// Zero is used by cells that apply to the channel as a whole (`open` and
/// its replies).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct CircId(u16);

impl From<u16> for CircId {
    fn from(item: u16) -> Self {
        Self(item)
    }
}
impl From<CircId> for u16 {
    fn from(id: CircId) -> u16 {
        id.0
    }
}
impl std::fmt::Display for CircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}
impl CircId {
    /// The circuit ID used by cells that concern the whole channel.
    pub const CHANNEL: CircId = CircId(0);

    /// Creates a `CircId` for `val`.
    pub const fn new(val: u16) -> Self {
        Self(val)
    }

    /// Return the numeric value of this ID.
    pub fn get(self) -> u16 {
        self.0
    }

    /// Return true if this is the channel-wide ID, zero.
    pub fn is_channel(self) -> bool {
        self.0 == 0
    }
}

/// The logical identity of a relay, used in the `open` handshake.
///
/// This is distinct from the relay's network address.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct AgentId(u32);

impl From<u32> for AgentId {
    fn from(item: u32) -> Self {
        Self(item)
    }
}
impl From<AgentId> for u32 {
    fn from(id: AgentId) -> u32 {
        id.0
    }
}
impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}

caret_int! {
    /// A ChanCmd is the type of a channel cell.
    pub struct ChanCmd(u8) {
        /// Create a new circuit
        CREATE = 1,
        /// Circuit creation succeeded
        CREATED = 2,
        /// Relay cell, transmitted over a circuit.
        RELAY = 3,
        /// Destroy a circuit
        DESTROY = 4,
        /// Begin the channel handshake: name who is opening and who is opened
        OPEN = 5,
        /// The channel handshake succeeded
        OPENED = 6,
        /// The channel handshake was refused
        OPEN_FAILED = 7,
        /// Circuit creation failed
        CREATE_FAILED = 8,
    }
}

impl ChanCmd {
    /// Return true if this command applies to a channel as a whole rather
    /// than to a single circuit.
    pub fn is_channel_level(self) -> bool {
        matches!(self, ChanCmd::OPEN | ChanCmd::OPENED | ChanCmd::OPEN_FAILED)
    }
}

/// A decoded channel cell, to be sent or received on a channel.
#[derive(Clone, Debug)]
pub struct ChanCell {
    /// Circuit ID associated with this cell
    circid: CircId,
    /// Underlying message in this cell
    msg: msg::AnyChanMsg,
}

impl ChanCell {
    /// Construct a new channel cell.
    pub fn new(circid: CircId, msg: msg::AnyChanMsg) -> Self {
        ChanCell { circid, msg }
    }
    /// Return the circuit ID for this cell.
    pub fn circid(&self) -> CircId {
        self.circid
    }
    /// Return a reference to the underlying message of this cell.
    pub fn msg(&self) -> &msg::AnyChanMsg {
        &self.msg
    }
    /// Consume this cell and return its components.
    pub fn into_circid_and_msg(self) -> (CircId, msg::AnyChanMsg) {
        (self.circid, self.msg)
    }
}
