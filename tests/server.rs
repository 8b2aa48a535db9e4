use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, bail};
use message_relay::{
    client::Client,
    handler::{Context, MAX_BODY_BYTES, handler},
    server::Server,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn sessions_are_assigned_sequential_identities() -> Result<()> {
    let server = start_server().await?;

    let (_first, first_id) = connect(server.addr).await?;
    let (_second, second_id) = connect(server.addr).await?;
    let (_third, third_id) = connect(server.addr).await?;

    assert_eq!(first_id, 1);
    assert_eq!(second_id, 2);
    assert_eq!(third_id, 3);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn list_reports_other_sessions_only() -> Result<()> {
    let server = start_server().await?;

    let (mut alice, _) = connect(server.addr).await?;
    assert!(timeout(READ_TIMEOUT, alice.list()).await??.is_empty());

    let (mut bob, _) = connect(server.addr).await?;
    let (_carol, _) = connect(server.addr).await?;

    assert_eq!(timeout(READ_TIMEOUT, alice.list()).await??, vec![2, 3]);
    assert_eq!(timeout(READ_TIMEOUT, bob.list()).await??, vec![1, 3]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn send_relays_the_body_to_each_recipient() -> Result<()> {
    let server = start_server().await?;

    let (mut alice, alice_id) = connect(server.addr).await?;
    let (mut bob, bob_id) = connect(server.addr).await?;
    let (mut carol, carol_id) = connect(server.addr).await?;

    let verdict = timeout(
        READ_TIMEOUT,
        alice.send(&[bob_id, carol_id], b"Hello world!"),
    )
    .await??;
    assert_eq!(verdict, "DONE");

    let incoming = timeout(READ_TIMEOUT, bob.next_incoming()).await??;
    assert_eq!(incoming.sender, alice_id);
    assert_eq!(incoming.body, b"Hello world!");

    let incoming = timeout(READ_TIMEOUT, carol.next_incoming()).await??;
    assert_eq!(incoming.sender, alice_id);
    assert_eq!(incoming.body, b"Hello world!");

    // Nothing was echoed back to the sender: its next response line answers
    // LIST, not a stray frame.
    assert_eq!(
        timeout(READ_TIMEOUT, alice.list()).await??,
        vec![bob_id, carol_id]
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn fan_out_never_echoes_to_the_sender() -> Result<()> {
    let server = start_server().await?;

    let (mut alice, alice_id) = connect(server.addr).await?;
    let (mut bob, bob_id) = connect(server.addr).await?;

    let verdict = timeout(READ_TIMEOUT, alice.send(&[alice_id, bob_id], b"no echo")).await??;
    assert_eq!(verdict, "DONE");

    let incoming = timeout(READ_TIMEOUT, bob.next_incoming()).await??;
    assert_eq!(incoming.sender, alice_id);
    assert_eq!(incoming.body, b"no echo");

    assert_eq!(timeout(READ_TIMEOUT, alice.list()).await??, vec![bob_id]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn recipient_count_limits_are_enforced() -> Result<()> {
    let server = start_server().await?;

    let (mut alice, alice_id) = connect(server.addr).await?;
    let (mut bob, _) = connect(server.addr).await?;

    let over: Vec<u64> = (2..=257).collect();
    let verdict = timeout(READ_TIMEOUT, alice.send(&over, b"too many")).await??;
    assert_eq!(verdict, "ERR RECIPIENTS 1-255");

    let verdict = timeout(READ_TIMEOUT, alice.send(&[], b"nobody")).await??;
    assert_eq!(verdict, "ERR RECIPIENTS 1-255");

    // The session survives rejection, and 255 recipients is accepted even
    // when most of them are absent.
    let at_limit: Vec<u64> = (2..=256).collect();
    let verdict = timeout(READ_TIMEOUT, alice.send(&at_limit, b"just enough")).await??;
    assert_eq!(verdict, "DONE");

    let incoming = timeout(READ_TIMEOUT, bob.next_incoming()).await??;
    assert_eq!(incoming.sender, alice_id);
    assert_eq!(incoming.body, b"just enough");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn body_size_limits_are_enforced() -> Result<()> {
    let server = start_server().await?;

    let (mut alice, alice_id) = connect(server.addr).await?;
    let (mut bob, bob_id) = connect(server.addr).await?;

    let oversized = vec![b'x'; MAX_BODY_BYTES + 1];
    let verdict = timeout(READ_TIMEOUT, alice.send(&[bob_id], &oversized)).await??;
    assert_eq!(verdict, "ERR TOO LARGE BODY 1M");

    // Drain the recipient concurrently so the relay's large write cannot
    // stall the sender's confirmation.
    let receiver = tokio::spawn(async move {
        let incoming = bob.next_incoming().await;
        (bob, incoming)
    });

    let body = vec![b'x'; MAX_BODY_BYTES];
    let verdict = timeout(READ_TIMEOUT, alice.send(&[bob_id], &body)).await??;
    assert_eq!(verdict, "DONE");

    let (_bob, incoming) = timeout(READ_TIMEOUT, receiver).await??;
    let incoming = incoming?;
    assert_eq!(incoming.sender, alice_id);
    assert_eq!(incoming.body.len(), MAX_BODY_BYTES);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_keywords_get_a_reply_without_ending_the_session() -> Result<()> {
    let server = start_server().await?;

    let (mut alice, alice_id) = connect(server.addr).await?;

    let reply = timeout(READ_TIMEOUT, alice.request("POOFF")).await??;
    assert_eq!(reply, "UNKNOWN MESSAGE");

    // Keywords are case-insensitive and surrounding whitespace is ignored.
    let reply = timeout(READ_TIMEOUT, alice.request("  identity ")).await??;
    assert_eq!(reply, alice_id.to_string());

    let reply = timeout(READ_TIMEOUT, alice.request("")).await??;
    assert_eq!(reply, "UNKNOWN MESSAGE");

    let id = timeout(READ_TIMEOUT, alice.identity()).await??;
    assert_eq!(id, alice_id);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn departed_sessions_leave_the_roster_and_identities_are_never_reused() -> Result<()> {
    let server = start_server().await?;

    let (mut alice, _) = connect(server.addr).await?;
    let (mut bob, bob_id) = connect(server.addr).await?;
    assert_eq!(bob_id, 2);

    bob.shutdown().await?;
    drop(bob);
    wait_for_roster(&mut alice, &[]).await?;

    let (_carol, carol_id) = connect(server.addr).await?;
    assert_eq!(carol_id, 3);
    assert_eq!(timeout(READ_TIMEOUT, alice.list()).await??, vec![3]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn fan_out_skips_recipients_that_departed() -> Result<()> {
    let server = start_server().await?;

    let (mut alice, alice_id) = connect(server.addr).await?;
    let (mut bob, bob_id) = connect(server.addr).await?;
    let (mut carol, carol_id) = connect(server.addr).await?;

    bob.shutdown().await?;
    drop(bob);
    wait_for_roster(&mut alice, &[carol_id]).await?;

    let verdict = timeout(
        READ_TIMEOUT,
        alice.send(&[bob_id, carol_id], b"still here"),
    )
    .await??;
    assert_eq!(verdict, "DONE");

    let incoming = timeout(READ_TIMEOUT, carol.next_incoming()).await??;
    assert_eq!(incoming.sender, alice_id);
    assert_eq!(incoming.body, b"still here");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_recipient_lines_terminate_the_session() -> Result<()> {
    let server = start_server().await?;

    let stream = TcpStream::connect(server.addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(b"SEND\none,two\nhello\n").await?;
    writer.flush().await?;

    // No error line comes back; the relay just closes the connection.
    let mut line = String::new();
    let bytes_read = timeout(READ_TIMEOUT, reader.read_line(&mut line)).await??;
    assert_eq!(bytes_read, 0, "expected EOF, got {line:?}");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn truncated_frames_terminate_the_session() -> Result<()> {
    let server = start_server().await?;

    let stream = TcpStream::connect(server.addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(b"SEND\n2\nchopped").await?;
    writer.shutdown().await?;

    let mut line = String::new();
    let bytes_read = timeout(READ_TIMEOUT, reader.read_line(&mut line)).await??;
    assert_eq!(bytes_read, 0, "expected EOF, got {line:?}");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn handlers_can_be_added_at_runtime() -> Result<()> {
    let server = start_server_with(|server| {
        server.register_handler(
            "PING",
            handler(|ctx: Context| async move {
                ctx.write_line("PONG").await?;
                Ok(())
            }),
        );
    })
    .await?;

    let (mut alice, _) = connect(server.addr).await?;
    let reply = timeout(READ_TIMEOUT, alice.request("PING")).await??;
    assert_eq!(reply, "PONG");

    // Built-ins keep working alongside the addition.
    let reply = timeout(READ_TIMEOUT, alice.request("LIST")).await??;
    assert_eq!(reply, "");

    server.stop().await;
    Ok(())
}

struct TestServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

async fn start_server() -> Result<TestServer> {
    start_server_with(|_| {}).await
}

async fn start_server_with(configure: impl FnOnce(&Server)) -> Result<TestServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = Server::new(listener);
    let addr = server.local_addr()?;
    configure(&server);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = server.run_until(shutdown).await;
    });

    Ok(TestServer {
        addr,
        shutdown_tx,
        handle,
    })
}

async fn connect(addr: SocketAddr) -> Result<(Client, u64)> {
    let mut client = Client::connect(addr).await?;
    let id = timeout(READ_TIMEOUT, client.identity()).await??;
    Ok((client, id))
}

async fn wait_for_roster(client: &mut Client, expected: &[u64]) -> Result<()> {
    for _ in 0..50 {
        let roster = timeout(READ_TIMEOUT, client.list()).await??;
        if roster == expected {
            return Ok(());
        }
        sleep(Duration::from_millis(20)).await;
    }
    bail!("roster never settled to {expected:?}")
}
