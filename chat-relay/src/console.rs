//! Terminal front ends for the server and the client.
//!
//! These are thin adapters: they turn stdin lines into calls on the core and
//! print whatever the core hands to their [`OutputSink`]. Retry and
//! confirmation prompts live here, never in the sessions.

use std::{io::BufRead, sync::Arc, thread};

use anyhow::{Context, Result};
use tokio::{select, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    cli::{ClientArgs, ServerArgs},
    client::{ClientEnd, ClientHandle, ClientSession},
    config::ServerConfig,
    error::ChatError,
    output::{OutputSink, StdoutSink},
    protocol::{is_blank, is_disconnect_sentinel},
    server::ChatServer,
};

/// Lines read from stdin on a dedicated thread.
///
/// Tokio cannot cancel a blocking stdin read, so the reader lives on a plain
/// thread that simply dies with the process.
pub struct ConsoleInput {
    lines: mpsc::Receiver<String>,
}

impl ConsoleInput {
    pub fn spawn() -> Self {
        let (tx, lines) = mpsc::channel(16);
        thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
        Self { lines }
    }

    /// Next line, or `None` once stdin is exhausted.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Asks until the user answers `y` or `n`. `None` if stdin ran out first.
    pub async fn confirm(&mut self, sink: &dyn OutputSink, question: &str) -> Option<bool> {
        sink.append_line(question);
        loop {
            sink.append_line("Please enter 'Y' or 'N':");
            let answer = self.next_line().await?;
            match answer.trim() {
                a if a.eq_ignore_ascii_case("y") => return Some(true),
                a if a.eq_ignore_ascii_case("n") => return Some(false),
                _ => continue,
            }
        }
    }
}

pub async fn run_server(args: ServerArgs) -> Result<()> {
    let config = ServerConfig::from(&args);
    let sink: Arc<dyn OutputSink> = Arc::new(StdoutSink);

    let server = ChatServer::bind(&config, Arc::clone(&sink)).await?;
    let addr = server.local_addr()?;
    info!(%addr, "server listening");
    sink.append_line(&format!("Server listening on {addr}"));
    sink.append_line("Type \"exit\" to stop the server");

    let mut input = ConsoleInput::spawn();
    server
        .run_until(async move { wait_for_exit(&mut input).await })
        .await;
    Ok(())
}

async fn wait_for_exit(input: &mut ConsoleInput) {
    select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                warn!(?error, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        }
        _ = wait_for_exit_command(input) => {}
    }
}

async fn wait_for_exit_command(input: &mut ConsoleInput) {
    while let Some(line) = input.next_line().await {
        if line.trim().eq_ignore_ascii_case("exit") {
            return;
        }
    }
    debug!("server console closed; stop with ctrl-c");
    std::future::pending::<()>().await;
}

pub async fn run_client(args: ClientArgs) -> Result<()> {
    let sink: Arc<dyn OutputSink> = Arc::new(StdoutSink);
    let mut input = ConsoleInput::spawn();

    let identity = match args.name.clone() {
        Some(name) => name,
        None => match prompt_identity(&mut input, sink.as_ref()).await {
            Some(name) => name,
            None => return Ok(()),
        },
    };
    let config = args.config(identity);

    let session = loop {
        match ClientSession::connect(&config, Arc::clone(&sink)).await {
            Ok(session) => break session,
            Err(error) => {
                warn!(%error, "connection attempt failed");
                let retry = input
                    .confirm(sink.as_ref(), "Failure to connect to server. Try again?")
                    .await;
                if retry != Some(true) {
                    return Ok(());
                }
            }
        }
    };

    sink.append_line("To disconnect, enter \"Disconnect Me\" and confirm when prompted");
    sink.append_line("Welcome to the chatroom:");

    let handle = session.handle();
    let running = tokio::spawn(session.run());
    relay_console_input(&mut input, &handle, sink.as_ref()).await;

    let end = running.await.context("client session task failed")?;
    if end == ClientEnd::Left {
        sink.append_line("You have left the chat");
    }
    Ok(())
}

async fn prompt_identity(input: &mut ConsoleInput, sink: &dyn OutputSink) -> Option<String> {
    loop {
        sink.append_line("Please enter your username:");
        let name = input.next_line().await?;
        if !name.is_empty() {
            return Some(name);
        }
    }
}

async fn relay_console_input(
    input: &mut ConsoleInput,
    handle: &ClientHandle,
    sink: &dyn OutputSink,
) {
    loop {
        let line = select! {
            _ = handle.closed() => return,
            line = input.next_line() => line,
        };

        let Some(line) = line else {
            handle.disconnect();
            return;
        };

        if is_disconnect_sentinel(line.trim()) {
            match input
                .confirm(sink, "Are you sure you want to disconnect?")
                .await
            {
                Some(false) => continue,
                Some(true) | None => {
                    handle.disconnect();
                    return;
                }
            }
        }

        if is_blank(&line) {
            continue;
        }
        match handle.send(line) {
            Ok(()) => {}
            Err(ChatError::InvalidLine) => {
                warn!("not sending a line with an embedded line terminator");
            }
            Err(_) => return,
        }
    }
}
