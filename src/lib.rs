//! Transparent TCP port forwarding.
//!
//! A [`Forwarder`] listens on one local port and bridges every accepted client
//! to a fixed destination `host:port`, relaying bytes both ways untouched.

pub mod config;
pub mod connection;
pub mod error;
pub mod forwarder;
pub mod relay;
pub mod telemetry;

pub use config::{ForwardConfig, Target, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE};
pub use connection::{Connection, LinkState, Teardown};
pub use error::{ForwardError, Result};
pub use forwarder::Forwarder;
pub use relay::{Direction, ExitReason, Relay, RelayExit};
