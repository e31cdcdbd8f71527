//! Types for parsing socket listen related config options.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// A collection of socket addresses to listen to.
///
/// A bare port number means "this port on every IPv4 and IPv6 address".
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedListen")]
// We use a `BTreeSet` here for (1) ensuring there are no duplicates and (2) deterministic ordering
// compared to a `HashSet`.
pub struct Listen(BTreeSet<SocketAddr>);

impl Listen {
    /// Listen on `port` at `0.0.0.0` and `[::]`.
    pub fn new_port(port: u16) -> Result<Self, ListenError> {
        UncheckedListen::Port(port).try_into()
    }

    /// Listen on exactly the addresses in `addrs`.
    pub fn new_addrs(addrs: impl IntoIterator<Item = SocketAddr>) -> Result<Self, ListenError> {
        UncheckedListen::Addr(addrs.into_iter().collect()).try_into()
    }

    /// Listen on a port of the operating system's choosing on the IPv4
    /// loopback address.
    ///
    /// The configuration file can't express this: it's meant for tests and
    /// for embedding a relay in another program.
    pub fn loopback_ephemeral() -> Self {
        Self([SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)].into())
    }

    /// The addresses to listen on.
    pub fn addrs(&self) -> impl Iterator<Item = &SocketAddr> + Clone {
        self.0.iter()
    }
}

impl Default for Listen {
    /// Listen on port 9001 at `0.0.0.0` and `[::]`.
    fn default() -> Self {
        let addrs: [IpAddr; 2] = [Ipv4Addr::UNSPECIFIED.into(), Ipv6Addr::UNSPECIFIED.into()];
        Self(addrs.into_iter().map(|ip| SocketAddr::new(ip, 9001)).collect())
    }
}

/// A deserialize helper for [`Listen`].
///
/// This is a `Listen` that has not yet been validated.
#[derive(Deserialize)]
#[serde(untagged, rename = "Listen")]
enum UncheckedListen {
    /// Listen on a port for all IPv4 and IPv6 addresses (`0.0.0.0` and `[::]`).
    Port(u16),
    /// Listen on a set of socket addresses.
    Addr(Vec<SocketAddr>),
}

impl TryFrom<UncheckedListen> for Listen {
    type Error = ListenError;

    fn try_from(from: UncheckedListen) -> Result<Self, Self::Error> {
        match from {
            UncheckedListen::Port(port @ 0) => Err(ListenError::InvalidPort { ip: None, port }),
            UncheckedListen::Port(port) => {
                // Listen at 0.0.0.0 and [::].
                let addrs: [IpAddr; 2] =
                    [Ipv4Addr::UNSPECIFIED.into(), Ipv6Addr::UNSPECIFIED.into()];
                let addrs = addrs
                    .into_iter()
                    .map(|ip| SocketAddr::new(ip, port))
                    .collect();
                Ok(Self(addrs))
            }
            UncheckedListen::Addr(addrs) => {
                if addrs.is_empty() {
                    return Err(ListenError::Empty);
                }

                // Ensure that no address had a port of 0.
                for addr in &addrs {
                    if addr.port() == 0 {
                        return Err(ListenError::InvalidPort {
                            ip: Some(addr.ip()),
                            port: addr.port(),
                        });
                    }
                }

                // Ensure that there were no duplicates.
                let count = addrs.len();
                let addrs: BTreeSet<_> = addrs.into_iter().collect();
                if addrs.len() != count {
                    return Err(ListenError::Duplicates);
                }

                Ok(Self(addrs))
            }
        }
    }
}

/// An error while deserializing a [`Listen`].
#[derive(Copy, Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ListenError {
    /// An invalid port was given.
    #[error(
        "{} does not have a valid port",
        .ip.map(|ip| SocketAddr::new(ip, *.port).to_string()).unwrap_or_else(|| .port.to_string()),
    )]
    InvalidPort {
        /// If this port was attached to an IP address, then the IP address can be provided here to
        /// give a better error message.
        ip: Option<IpAddr>,
        /// The invalid port.
        port: u16,
    },
    /// Duplicate socket addresses were given.
    #[error("duplicate socket addresses were given")]
    Duplicates,
    /// No socket addresses were given.
    #[error("no socket addresses were given")]
    Empty,
}
