//! Environment configuration.
//!
//! | Variable | Default |
//! |---|---|
//! | `PROXY_PORT` | `3000` |
//! | `GATEWAY_PORT` | `3001` |
//! | `GOG_SERVE_PORT` | `8788` |
//! | `PROXY_ROUTE_PREFIX` | `/gmail-pubsub` |
//! | `PROXY_SHUTDOWN_GRACE_SECS` | `30` |
//!
//! An unset or empty variable takes its default. Anything else that does
//! not parse is an [`Error::Config`].

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::route::Routes;

pub const DEFAULT_LISTEN_PORT: u16 = 3000;
pub const DEFAULT_PRIMARY_PORT: u16 = 3001;
pub const DEFAULT_SECONDARY_PORT: u16 = 8788;
pub const DEFAULT_ROUTE_PREFIX: &str = "/gmail-pubsub";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Process-wide settings, read once at startup and never mutated.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen_port: u16,
    pub primary_port: u16,
    pub secondary_port: u16,
    pub route_prefix: String,
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            primary_port: DEFAULT_PRIMARY_PORT,
            secondary_port: DEFAULT_SECONDARY_PORT,
            route_prefix: DEFAULT_ROUTE_PREFIX.to_owned(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl Config {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads settings through `lookup`, which maps a variable name to its
    /// value. Lets callers (and tests) supply variables without touching the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            listen_port: parse_var(&lookup, "PROXY_PORT", defaults.listen_port)?,
            primary_port: parse_var(&lookup, "GATEWAY_PORT", defaults.primary_port)?,
            secondary_port: parse_var(&lookup, "GOG_SERVE_PORT", defaults.secondary_port)?,
            route_prefix: non_empty(&lookup, "PROXY_ROUTE_PREFIX").unwrap_or(defaults.route_prefix),
            shutdown_grace: parse_var(&lookup, "PROXY_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace.as_secs())
                .map(Duration::from_secs)?,
        })
    }

    /// All interfaces, on the configured listen port.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.listen_port))
    }

    pub fn routes(&self) -> Routes {
        Routes::new(self.route_prefix.clone(), self.primary_port, self.secondary_port)
    }
}

fn non_empty<F>(lookup: &F, var: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var).filter(|v| !v.trim().is_empty())
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, Error>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match non_empty(lookup, var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| Error::Config { var, value }),
    }
}
