//! Wire vocabulary of the plaintext line protocol.
//!
//! Client to server: the first line is the raw identity, every later line is
//! chat text, and [`DISCONNECT_SENTINEL`] (any letter case) asks to leave.
//! Server to client: chat lines prefixed with the sender's identity, plus the
//! join, leave, and shutdown notices built here.

/// Control line a client sends to leave. Never relayed as chat content.
pub const DISCONNECT_SENTINEL: &str = "disconnect me";

/// Shown locally by a client whose inbound stream ended unexpectedly.
pub const CONNECTION_LOST: &str = "Connection has been lost";

/// Broadcast by the server right before it closes every session.
pub const SHUTDOWN_NOTICE: &str = "Server is shutting down";

pub fn is_disconnect_sentinel(line: &str) -> bool {
    line.eq_ignore_ascii_case(DISCONNECT_SENTINEL)
}

/// Lines that are empty or only whitespace are not relayed.
pub fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// Drops carriage returns left inside a received line, so whatever a peer
/// sends can be relayed as exactly one outgoing line.
pub fn scrub(line: &str) -> String {
    line.replace('\r', "")
}

pub fn chat_line(identity: &str, text: &str) -> String {
    format!("{identity}: {text}")
}

pub fn joined_line(identity: &str) -> String {
    format!("{identity} has connected")
}

pub fn left_line(identity: &str) -> String {
    format!("User {identity} has disconnected")
}
