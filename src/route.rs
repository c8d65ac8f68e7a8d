//! Route decision.
//!
//! Two backends, one literal prefix. A path that starts with the prefix goes
//! to the secondary backend; everything else goes to the primary. There is
//! no table to walk and nothing to normalise: `/gmail-pubsub`,
//! `/gmail-pubsub/push` and `/gmail-pubsubextra` all match, `/Gmail-pubsub`
//! does not.

use std::net::{Ipv4Addr, SocketAddr};

/// Which of the two fixed backends a request is sent to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Backend {
    /// Default destination. Also receives every upgrade.
    Primary,
    /// Destination for paths under the route prefix.
    Secondary,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary   => "primary",
            Self::Secondary => "secondary",
        }
    }
}

/// The immutable two-entry routing table.
///
/// Built once at startup from [`Config`](crate::Config) and shared read-only
/// by every connection task.
#[derive(Clone, Debug)]
pub struct Routes {
    prefix: String,
    primary: SocketAddr,
    secondary: SocketAddr,
}

impl Routes {
    /// Both backends are addressed on the IPv4 loopback interface.
    pub fn new(prefix: impl Into<String>, primary_port: u16, secondary_port: u16) -> Self {
        Self {
            prefix: prefix.into(),
            primary: SocketAddr::from((Ipv4Addr::LOCALHOST, primary_port)),
            secondary: SocketAddr::from((Ipv4Addr::LOCALHOST, secondary_port)),
        }
    }

    /// Picks the backend for a raw request target (path plus optional query).
    pub fn route(&self, path: &str) -> Backend {
        if path.starts_with(self.prefix.as_str()) {
            Backend::Secondary
        } else {
            Backend::Primary
        }
    }

    /// Upgrade traffic never consults the prefix.
    pub fn upgrade(&self) -> Backend {
        Backend::Primary
    }

    pub fn addr(&self, backend: Backend) -> SocketAddr {
        match backend {
            Backend::Primary   => self.primary,
            Backend::Secondary => self.secondary,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}
