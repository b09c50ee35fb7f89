use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow};
use chat_relay::{
    codec::Framing,
    config::ServerConfig,
    server::{LogLine, RelayServer},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpSocket, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(1);

struct RunningRelay {
    addr: SocketAddr,
    logs: mpsc::UnboundedReceiver<LogLine>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl RunningRelay {
    async fn start(framing: Framing) -> Result<Self> {
        let config = ServerConfig {
            listen: "127.0.0.1:0".parse()?,
            framing,
            ..ServerConfig::default()
        };
        let (server, logs) = RelayServer::bind(&config)?;
        let addr = server.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        Ok(Self {
            addr,
            logs,
            shutdown,
            task,
        })
    }

    /// Waits for a log line matching `predicate`, skipping the others.
    async fn expect_log(&mut self, predicate: impl Fn(&str) -> bool) -> Result<String> {
        loop {
            let line = timeout(READ_TIMEOUT, self.logs.recv())
                .await
                .context("timed out waiting for relay log")?
                .context("relay log closed")?;
            if predicate(&line.0) {
                return Ok(line.0);
            }
        }
    }

    async fn stop(self) -> Result<Vec<String>> {
        let RunningRelay {
            mut logs,
            shutdown,
            task,
            ..
        } = self;
        let _ = shutdown.send(());
        timeout(READ_TIMEOUT, task)
            .await
            .context("relay did not stop")???;

        let mut rest = Vec::new();
        while let Some(line) = logs.recv().await {
            rest.push(line.0);
        }
        Ok(rest)
    }
}

struct TestClient {
    local: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connects and waits until the relay has registered the connection.
    async fn connect(relay: &mut RunningRelay) -> Result<Self> {
        let stream = TcpStream::connect(relay.addr).await?;
        Self::admitted(relay, stream).await
    }

    async fn admitted(relay: &mut RunningRelay, stream: TcpStream) -> Result<Self> {
        let local = stream.local_addr()?;
        let expected = format!("New connection from {local}");
        relay.expect_log(|line| line == expected).await?;

        let (reader, writer) = stream.into_split();
        Ok(Self {
            local,
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn join(relay: &mut RunningRelay, name: &str) -> Result<Self> {
        let client = Self::connect(relay).await?;
        client.announce(name).await
    }

    async fn announce(mut self, name: &str) -> Result<Self> {
        self.send(&format!("NAME:{name}\n")).await?;
        assert_eq!(self.recv().await?, format!("SYS:{name} joined"));
        Ok(self)
    }

    async fn send(&mut self, raw: &str) -> Result<()> {
        self.writer.write_all(raw.as_bytes()).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .context("timed out waiting for relay")??;
        if read == 0 {
            return Err(anyhow!("relay closed the connection"));
        }
        Ok(line.trim_end_matches('\n').to_string())
    }

    async fn expect_silence(&mut self) -> Result<()> {
        let mut line = String::new();
        let read = timeout(Duration::from_millis(200), self.reader.read_line(&mut line)).await;
        match read {
            Err(_) => Ok(()),
            Ok(result) => Err(anyhow!("unexpected data {line:?} ({result:?})")),
        }
    }
}

#[tokio::test]
async fn chat_reaches_every_named_client_including_sender() -> Result<()> {
    let mut relay = RunningRelay::start(Framing::Lines).await?;
    let mut alice = TestClient::join(&mut relay, "alice").await?;
    let mut bob = TestClient::join(&mut relay, "bob").await?;
    assert_eq!(alice.recv().await?, "SYS:bob joined");

    alice.send("MSG:hello bob\n").await?;

    assert_eq!(alice.recv().await?, "FROM:alice:hello bob");
    assert_eq!(bob.recv().await?, "FROM:alice:hello bob");

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unnamed_connection_cannot_chat_but_still_hears_broadcasts() -> Result<()> {
    let mut relay = RunningRelay::start(Framing::Lines).await?;
    let mut lurker = TestClient::connect(&mut relay).await?;
    let mut alice = TestClient::join(&mut relay, "alice").await?;
    assert_eq!(lurker.recv().await?, "SYS:alice joined");

    lurker.send("MSG:anyone there?\n").await?;
    alice.expect_silence().await?;

    alice.send("MSG:hi\n").await?;
    assert_eq!(lurker.recv().await?, "FROM:alice:hi");

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn leaving_client_is_announced_and_later_chat_reaches_only_the_rest() -> Result<()> {
    let mut relay = RunningRelay::start(Framing::Lines).await?;
    let alice = TestClient::join(&mut relay, "alice").await?;
    let mut bob = TestClient::join(&mut relay, "bob").await?;

    let alice_addr = alice.local;
    drop(alice);

    assert_eq!(bob.recv().await?, "SYS:alice left");
    let expected = format!("Client disconnected: {alice_addr}");
    relay.expect_log(|line| line == expected).await?;

    bob.send("MSG:anyone left?\n").await?;
    assert_eq!(bob.recv().await?, "FROM:bob:anyone left?");
    relay.expect_log(|line| line == "bob: anyone left?").await?;
    bob.expect_silence().await?;

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn messages_arrive_in_send_order() -> Result<()> {
    let mut relay = RunningRelay::start(Framing::Lines).await?;
    let mut alice = TestClient::join(&mut relay, "alice").await?;
    let mut bob = TestClient::join(&mut relay, "bob").await?;
    assert_eq!(alice.recv().await?, "SYS:bob joined");

    let batch: String = (0..50).map(|i| format!("MSG:message {i}\n")).collect();
    alice.send(&batch).await?;

    for i in 0..50 {
        assert_eq!(bob.recv().await?, format!("FROM:alice:message {i}"));
    }
    for i in 0..50 {
        assert_eq!(alice.recv().await?, format!("FROM:alice:message {i}"));
    }

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn lines_split_across_writes_are_reassembled() -> Result<()> {
    let mut relay = RunningRelay::start(Framing::Lines).await?;
    let mut alice = TestClient::join(&mut relay, "alice").await?;

    alice.send("MSG:hel").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.send("lo\r\n").await?;

    assert_eq!(alice.recv().await?, "FROM:alice:hello");

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn blank_name_registers_as_peer_address_and_duplicates_are_allowed() -> Result<()> {
    let mut relay = RunningRelay::start(Framing::Lines).await?;
    let mut anon = TestClient::connect(&mut relay).await?;
    anon.send("NAME:\n").await?;
    assert_eq!(anon.recv().await?, format!("SYS:{} joined", anon.local));

    let mut first = TestClient::join(&mut relay, "sam").await?;
    let mut second = TestClient::join(&mut relay, "sam").await?;
    assert_eq!(first.recv().await?, "SYS:sam joined");

    second.send("MSG:which one?\n").await?;
    assert_eq!(first.recv().await?, "FROM:sam:which one?");
    assert_eq!(second.recv().await?, "FROM:sam:which one?");

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn chunk_framing_treats_each_read_as_a_message() -> Result<()> {
    let mut relay = RunningRelay::start(Framing::Chunks).await?;
    let mut alice = TestClient::connect(&mut relay).await?;

    alice.send("NAME:alice").await?;
    assert_eq!(alice.recv().await?, "SYS:alice joined");
    alice.send("MSG:no newline here").await?;
    assert_eq!(alice.recv().await?, "FROM:alice:no newline here");

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn relay_logs_activity_in_order() -> Result<()> {
    let mut relay = RunningRelay::start(Framing::Lines).await?;
    relay
        .expect_log(|line| line == "Server started. Waiting for connections.")
        .await?;

    let mut alice = TestClient::join(&mut relay, "alice").await?;
    alice.send("MSG:hi\n").await?;
    assert_eq!(alice.recv().await?, "FROM:alice:hi");
    let alice_addr = alice.local;
    drop(alice);

    relay.expect_log(|line| line == "SYS:alice joined").await?;
    relay.expect_log(|line| line == "alice: hi").await?;
    let expected = format!("Client disconnected: {alice_addr}");
    relay.expect_log(|line| line == expected).await?;
    relay.expect_log(|line| line == "SYS:alice left").await?;

    let rest = relay.stop().await?;
    assert_eq!(rest.last().map(String::as_str), Some("Server stopped."));
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_the_listener() -> Result<()> {
    let mut relay = RunningRelay::start(Framing::Lines).await?;
    let addr = relay.addr;
    let mut alice = TestClient::join(&mut relay, "alice").await?;

    relay.stop().await?;

    assert!(TcpStream::connect(addr).await.is_err());
    assert!(alice.recv().await.is_err());
    Ok(())
}

#[tokio::test]
async fn slow_reader_keeps_draining_while_others_chat() -> Result<()> {
    const BURST: usize = 8_000;

    let mut relay = RunningRelay::start(Framing::Lines).await?;
    let mut alice = TestClient::join(&mut relay, "alice").await?;

    let socket = TcpSocket::new_v4()?;
    socket.set_recv_buffer_size(4 * 1024)?;
    let stream = socket.connect(relay.addr).await?;
    let bob = TestClient::admitted(&mut relay, stream)
        .await?
        .announce("bob")
        .await?;
    assert_eq!(alice.recv().await?, "SYS:bob joined");

    let TestClient {
        reader: mut alice_reader,
        writer: mut alice_writer,
        ..
    } = alice;
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut alice_reader, &mut tokio::io::sink()).await;
    });

    // Far more than the socket buffers toward bob can hold.
    let line = format!("MSG:{}\n", "x".repeat(1000));
    alice_writer.write_all(line.repeat(BURST).as_bytes()).await?;

    let mut bob_reader = bob.reader;
    let bob_task = tokio::spawn(async move {
        let mut line = String::new();
        let mut received = 0;
        while received < BURST {
            line.clear();
            if bob_reader.read_line(&mut line).await? == 0 {
                return Err(anyhow!("relay closed bob after {received} lines"));
            }
            if line.starts_with("FROM:alice:x") {
                received += 1;
            }
        }
        Ok::<_, anyhow::Error>(())
    });
    let bob_done = timeout(Duration::from_secs(15), bob_task);
    tokio::pin!(bob_done);

    // Inbound chatter must not hold back the retry of bob's blocked writes.
    let mut ticks = interval(Duration::from_millis(10));
    loop {
        select! {
            done = &mut bob_done => {
                done.context("bob stalled while alice kept chatting")???;
                break;
            }
            _ = ticks.tick() => alice_writer.write_all(b"MSG:tick\n").await?,
        }
    }

    relay.stop().await?;
    Ok(())
}
