use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    ClientConfig, DEFAULT_CLIENT_HOST, DEFAULT_PORT, DEFAULT_SERVER_HOST, ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server; type "exit" on its console to stop it.
    Server(ServerArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host or address to listen on.
    #[arg(long, default_value = DEFAULT_SERVER_HOST)]
    pub host: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Milliseconds a single delivery may take before that client is dropped.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server host to connect to.
    #[arg(long, default_value = DEFAULT_CLIENT_HOST)]
    pub host: String,

    /// Server port to connect to.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Name shown in front of your messages. Prompted for when omitted.
    #[arg(long)]
    pub name: Option<String>,
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        ServerConfig::new(args.host.clone(), args.port)
            .with_write_timeout(Duration::from_millis(args.write_timeout_ms))
    }
}

impl ClientArgs {
    pub fn config(&self, identity: impl Into<String>) -> ClientConfig {
        ClientConfig::new(self.host.clone(), self.port, identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::try_parse_from(["chat-relay", "server"]).expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        let config = ServerConfig::from(&args);
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn client_flags() {
        let cli = Cli::try_parse_from([
            "chat-relay",
            "client",
            "--host",
            "10.0.0.5",
            "--port",
            "9000",
            "--name",
            "alice",
        ])
        .expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.name.as_deref(), Some("alice"));
        assert_eq!(args.config("alice").address(), "10.0.0.5:9000");
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let result = Cli::try_parse_from(["chat-relay", "client", "--port", "70000"]);
        assert!(result.is_err());
    }
}
