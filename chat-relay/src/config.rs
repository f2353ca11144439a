use std::time::Duration;

use crate::registry::DEFAULT_WRITE_TIMEOUT;

pub const DEFAULT_PORT: u16 = 14001;
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_CLIENT_HOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    /// Use 0 for an ephemeral port.
    pub port: u16,
    /// How long one broadcast write may take before the recipient is dropped.
    pub write_timeout: Duration,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_HOST, DEFAULT_PORT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Sent verbatim as the first line; prefixes every message this client sends.
    pub identity: String,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, identity: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            identity: identity.into(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
