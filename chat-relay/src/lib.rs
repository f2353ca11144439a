//! Line-oriented broadcast chat over TCP.
//!
//! A server accepts connections, takes the first line of each as the client's
//! identity, and rebroadcasts every later line to all connected clients as
//! `"<identity>: <text>"`, including the sender. Each module owns one piece:
//!
//! - [`transport`] frames a byte stream into newline-terminated lines and
//!   serializes concurrent writers.
//! - [`registry`] tracks the write sides of joined clients and fans lines out
//!   to them, isolating per-recipient failures.
//! - [`session`] runs the server side of one connection: handshake, relay loop,
//!   and exactly-once teardown.
//! - [`server`] accepts connections, spawns sessions, and shuts them all down.
//! - [`client`] runs the client side: identity, outbound and inbound flows.
//! - [`protocol`] holds the sentinel and the system line formats.
//! - [`output`] is the one capability a display needs to implement.
//! - [`config`], [`cli`], and [`console`] wire the above into a terminal program.
//!
//! Unit tests use in-memory duplex streams; the integration tests under
//! `tests/` run real sockets and the compiled binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod output;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{ChatError, Result};
