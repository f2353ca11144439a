use std::{process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const BINARY: &str = env!("CARGO_BIN_EXE_chat-relay");

#[tokio::test]
async fn console_chat_end_to_end() -> Result<()> {
    let mut server = Process::spawn(&["server", "--host", "127.0.0.1", "--port", "0"], "server")?;
    let port = read_listening_port(&mut server).await?;
    server
        .expect_line("Type \"exit\" to stop the server")
        .await?;

    let mut alice = spawn_client("alice", &port).await?;
    alice.expect_line("alice has connected").await?;
    server.expect_line("alice has connected").await?;

    let mut bob = spawn_client("bob", &port).await?;
    bob.expect_line("bob has connected").await?;
    alice.expect_line("bob has connected").await?;
    server.expect_line("bob has connected").await?;

    // Alice greets Bob; both of them, and the server console, see it.
    alice.send_line("Hello from Alice").await?;
    bob.expect_line("alice: Hello from Alice").await?;
    alice.expect_line("alice: Hello from Alice").await?;
    server.expect_line("alice: Hello from Alice").await?;

    // Blank input is never sent.
    bob.send_line("   ").await?;
    bob.send_line("Hi Alice!").await?;
    alice.expect_line("bob: Hi Alice!").await?;
    bob.expect_line("bob: Hi Alice!").await?;
    server.expect_line("bob: Hi Alice!").await?;

    // Declining the confirmation keeps Bob connected.
    bob.send_line("Disconnect Me").await?;
    bob.expect_line("Are you sure you want to disconnect?").await?;
    bob.expect_line("Please enter 'Y' or 'N':").await?;
    bob.send_line("n").await?;
    bob.send_line("still here").await?;
    alice.expect_line("bob: still here").await?;
    bob.expect_line("bob: still here").await?;
    server.expect_line("bob: still here").await?;

    // Confirming it leaves the chat.
    bob.send_line("disconnect me").await?;
    bob.expect_line("Are you sure you want to disconnect?").await?;
    bob.expect_line("Please enter 'Y' or 'N':").await?;
    bob.send_line("y").await?;
    bob.expect_line("You have left the chat").await?;
    alice.expect_line("User bob has disconnected").await?;
    server.expect_line("User bob has disconnected").await?;
    bob.ensure_success().await?;

    // Stopping the server drops Alice with a notice.
    server.send_line("exit").await?;
    alice.expect_line("Server is shutting down").await?;
    alice.expect_line("Connection has been lost").await?;
    alice.ensure_success().await?;
    server.ensure_success().await?;

    Ok(())
}

#[tokio::test]
async fn server_refuses_a_port_in_use() -> Result<()> {
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = taken.local_addr()?.port().to_string();

    let mut server = Process::spawn(&["server", "--host", "127.0.0.1", "--port", &port], "server")?;
    let status = timeout(READ_TIMEOUT, server.child.wait())
        .await
        .context("server should exit when it cannot bind")??;
    assert!(!status.success());
    Ok(())
}

struct Process {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Process {
    fn spawn(args: &[&str], name: &str) -> Result<Self> {
        let mut child = Command::new(BINARY)
            .args(args)
            .env("RUST_LOG", "warn")
            .env("RUST_LOG_STYLE", "never")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {name}"))?;

        let stdin = child
            .stdin
            .take()
            .with_context(|| format!("{name} stdin missing after spawn"))?;
        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("{name} stdout missing after spawn"))?;

        Ok(Self {
            name: name.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send '{line}' to {}", self.name))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let bytes = timeout(READ_TIMEOUT, self.stdout.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("{}: timed out waiting for line", self.name))??;
        if bytes == 0 {
            return Err(anyhow!("{}: stdout closed", self.name));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn expect_line(&mut self, expected: &str) -> Result<()> {
        let line = self.read_line().await?;
        if line != expected {
            return Err(anyhow!("{}: expected '{expected}', got '{line}'", self.name));
        }
        Ok(())
    }

    async fn ensure_success(&mut self) -> Result<()> {
        let status = timeout(READ_TIMEOUT, self.child.wait())
            .await
            .with_context(|| format!("{} did not exit", self.name))?
            .with_context(|| format!("failed to await {}", self.name))?;
        if !status.success() {
            return Err(anyhow!("{} exited with status {status}", self.name));
        }
        Ok(())
    }
}

async fn read_listening_port(server: &mut Process) -> Result<String> {
    let banner = server.read_line().await?;
    let addr = banner
        .strip_prefix("Server listening on ")
        .with_context(|| format!("unexpected server banner '{banner}'"))?;
    let (_, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("server banner missing port: '{banner}'"))?;
    Ok(port.to_string())
}

async fn spawn_client(name: &str, port: &str) -> Result<Process> {
    let mut client = Process::spawn(
        &[
            "client", "--host", "127.0.0.1", "--port", port, "--name", name,
        ],
        name,
    )?;
    client
        .expect_line("To disconnect, enter \"Disconnect Me\" and confirm when prompted")
        .await?;
    client.expect_line("Welcome to the chatroom:").await?;
    Ok(client)
}
