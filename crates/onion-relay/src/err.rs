//! Define an error type for the onion-relay crate.
use std::sync::Arc;

use onion_cell::chancell::AgentId;
use thiserror::Error;
use tor_error::{ErrorKind, HasKind};

/// An error type for the onion-relay crate.
///
/// Errors on one channel or circuit are handled where they occur; none of
/// them is fatal to the relay as a whole.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred from the io system when using a
    /// channel.
    #[error("IO error on channel with peer")]
    ChanIoErr(#[source] Arc<std::io::Error>),
    /// An error from the io system that occurred when trying to connect a channel.
    #[error("IO error while handshaking with peer")]
    HandshakeIoErr(#[source] Arc<std::io::Error>),
    /// We couldn't reach the destination of a stream.
    #[error("Unable to connect to {target}")]
    ConnectErr {
        /// The destination we were trying to reach.
        target: String,
        /// The error that occurred.
        #[source]
        err: Arc<std::io::Error>,
    },
    /// An error occurred while trying to create or encode a cell.
    #[error("Unable to generate or encode {object}")]
    CellEncodeErr {
        /// The object we were trying to create or encode.
        object: &'static str,
        /// The error that occurred.
        #[source]
        err: onion_cell::Error,
    },
    /// An error occurred while trying to decode or parse a cell.
    #[error("Error while parsing {object}")]
    CellDecodeErr {
        /// The object we were trying to decode.
        object: &'static str,
        /// The error that occurred.
        #[source]
        err: onion_cell::Error,
    },
    /// Protocol violation at the channel level.
    #[error("Channel protocol violation: {0}")]
    ChanProto(String),
    /// Protocol violation at the circuit level.
    #[error("Circuit protocol violation: {0}")]
    CircProto(String),
    /// The peer answered our `open` with `open-failed`.
    #[error("Relay {0} refused to open a channel")]
    OpenRefused(AgentId),
    /// The peer answered our `create` with `create-failed`.
    #[error("Circuit creation refused")]
    CreateRefused,
    /// The circuit was destroyed while we were waiting for an answer.
    #[error("Circuit closed")]
    CircuitClosed,
    /// The last hop couldn't open the stream we asked for.
    #[error("Stream refused by the last hop")]
    BeginRefused,
    /// The last hop couldn't extend the circuit.
    #[error("Circuit extension refused by the last hop")]
    ExtendRefused,
    /// Tried to use a channel that is closed.
    #[error("Channel closed")]
    ChannelClosed,
    /// We waited too long for something to happen.
    #[error("Timed out while waiting for {0}")]
    Timeout(&'static str),
    /// Can't allocate any more circuit or stream IDs.
    #[error("Too many entries in map: can't allocate ID")]
    IdRangeFull,
    /// There was a programming error somewhere in our code, or the calling code.
    #[error("Programming error")]
    Bug(#[from] tor_error::Bug),
}

impl Error {
    /// Create an error from an onion_cell error that has occurred while trying
    /// to encode or create something of type `object`
    pub(crate) fn from_cell_enc(err: onion_cell::Error, object: &'static str) -> Error {
        Error::CellEncodeErr { object, err }
    }

    /// Create an error from an onion_cell error that has occurred while trying
    /// to decode something of type `object`
    pub(crate) fn from_cell_dec(err: onion_cell::Error, object: &'static str) -> Error {
        match err {
            onion_cell::Error::ChanProto(msg) => Error::ChanProto(msg),
            _ => Error::CellDecodeErr { err, object },
        }
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::ChanIoErr(_) => EK::LocalNetworkError,
            E::HandshakeIoErr(_) => EK::TorAccessFailed,
            E::ConnectErr { .. } => EK::RemoteNetworkFailed,
            E::CellEncodeErr { err, .. } => err.kind(),
            E::CellDecodeErr { err, .. } => err.kind(),
            E::ChanProto(_) => EK::TorProtocolViolation,
            E::CircProto(_) => EK::TorProtocolViolation,
            E::OpenRefused(_) => EK::TorAccessFailed,
            E::CreateRefused => EK::CircuitRefused,
            E::CircuitClosed => EK::CircuitCollapse,
            E::BeginRefused => EK::RemoteNetworkFailed,
            E::ExtendRefused => EK::CircuitRefused,
            E::ChannelClosed => EK::CircuitCollapse,
            E::Timeout(_) => EK::TorNetworkTimeout,
            E::IdRangeFull => EK::BadApiUsage,
            E::Bug(e) => e.kind(),
        }
    }
}

/// Internal type: Error return value from the relay's per-channel tasks.
///
/// This tells the task why it stopped; it is never shown to a peer.
#[derive(Debug)]
pub(crate) enum ReactorError {
    /// The channel or the relay is shutting down: this is not an error.
    Shutdown,
    /// The peer sent nothing for longer than the idle timeout.
    Idle,
    /// An error occurred on the channel.
    Err(Error),
}

impl From<Error> for ReactorError {
    fn from(e: Error) -> ReactorError {
        ReactorError::Err(e)
    }
}
