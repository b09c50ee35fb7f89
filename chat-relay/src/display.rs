//! Terminal front ends for the relay and the client.
//!
//! Both run on the main task and talk to their background loop only through
//! channels: the relay hands out [`LogLine`]s, the client session hands out
//! [`ClientEvent`]s and takes chat text through its [`ClientHandle`].

use std::{io::BufRead, thread};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt},
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    client::{self, ClientEvent, ClientHandle},
    config::{ClientConfig, ServerConfig},
    server::{LogLine, RelayServer},
};

/// Text shown for one client event.
pub fn render(event: &ClientEvent) -> String {
    match event {
        ClientEvent::SystemNotice(text) => format!("[SYSTEM] {text}"),
        ClientEvent::OwnMessage(text) => format!("> {text}"),
        ClientEvent::OtherMessage { sender, text } => format!("{sender}: {text}"),
    }
}

/// Binds the relay, announces its address, and prints its log until Ctrl-C.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let (server, logs) = RelayServer::bind(&config)
        .with_context(|| format!("failed to listen on {}", config.listen))?;
    let addr = server.local_addr()?;
    info!(%addr, backlog = config.backlog, framing = ?config.framing, "relay bound");
    write_stdout(&format!("Relay listening on {addr}")).await?;

    let printer = tokio::spawn(print_logs(logs));
    let result = server.run_until_ctrl_c().await;

    // The log sender went away with the relay, so the printer drains and ends.
    if let Err(error) = printer.await {
        warn!(?error, "log printer task failed");
    }
    result
}

async fn print_logs(mut logs: mpsc::UnboundedReceiver<LogLine>) {
    while let Some(line) = logs.recv().await {
        if let Err(error) = write_stdout(&line.to_string()).await {
            warn!(?error, "failed to print relay log");
            break;
        }
    }
}

/// Runs an interactive client: stdin lines become chat, session events are
/// printed. `/quit`, end of input, or Ctrl-C ends it.
pub async fn run_client(config: ClientConfig) -> Result<()> {
    let (handle, mut events) = client::spawn(config);
    info!(name = handle.identity(), "client starting");

    let mut lines = spawn_stdin_reader();

    loop {
        select! {
            Some(event) = events.recv() => write_stdout(&render(&event)).await?,
            line = lines.recv() => {
                if !handle_input(line.transpose()?, &handle).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    handle.shutdown();
    handle.stopped().await;
    Ok(())
}

/// Reads stdin on a plain thread. A blocked read on tokio's stdin cannot be
/// cancelled and would hold up runtime shutdown after `/quit`.
fn spawn_stdin_reader() -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn handle_input(line: Option<String>, handle: &ClientHandle) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };

    let text = line.trim();
    if text.eq_ignore_ascii_case("/quit") {
        write_stdout(&render(&ClientEvent::SystemNotice("Leaving chat".into()))).await?;
        return Ok(false);
    }

    handle.send_chat(text);
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
