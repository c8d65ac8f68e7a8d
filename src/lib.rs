//! # splitgate
//!
//! A reverse proxy with exactly two backends and one rule.
//! Nothing more. Nothing less.
//!
//! ## The contract
//!
//! One public port. Requests whose path starts with the route prefix
//! (`/gmail-pubsub` by default) go to the secondary backend; everything else,
//! and every protocol upgrade, goes to the primary. Both backends live on
//! loopback.
//!
//! What splitgate intentionally does not do:
//!
//! - **Load balancing, retries, health checks**: one destination, one attempt
//! - **TLS termination**: the platform's edge owns it
//! - **Rewriting**: method, path, headers and bodies pass through untouched
//! - **Buffering**: bodies and tunnels are streamed as bytes arrive
//!
//! What's left:
//!
//! - [`route`]: the prefix decision
//! - [`head`]: sniffing the first request to tell upgrades from plain HTTP
//! - [`forward`]: hyper in, hyper out, `502` when the backend is gone
//! - [`tunnel`]: handshake replay and a raw two-way splice
//! - [`Server`]: accept loop and graceful shutdown
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use splitgate::{Config, Server};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), splitgate::Error> {
//!     Server::new(Config::from_env()?).serve().await
//! }
//! ```

mod config;
mod error;
mod rewind;
mod server;

pub mod forward;
pub mod head;
pub mod route;
pub mod tunnel;

pub use config::Config;
pub use error::Error;
pub use route::{Backend, Routes};
pub use server::Server;
