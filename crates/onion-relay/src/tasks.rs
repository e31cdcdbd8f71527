//! Background tasks of the onion relay.
//!
//! Every task is spawned on the relay's task tracker, and stops once the
//! relay's shutdown token is cancelled.

pub(crate) mod extend;
pub(crate) mod listeners;
pub(crate) mod pump;
pub(crate) mod reader;
