use std::{collections::VecDeque, net::SocketAddr};

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{debug, warn};

use crate::{
    cli::ClientArgs,
    message::{self, IncomingFrame, ProtocolError, SendFrame, UNKNOWN_MESSAGE},
};

/// Typed handle over one relay connection, one method per wire command.
/// Request/response correlation assumes no server push arrives while a
/// request is in flight; callers wanting pushes use [`Client::next_incoming`]
/// between requests.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        debug!("connected to {addr}");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Asks the relay for this connection's assigned identity.
    pub async fn identity(&mut self) -> Result<u64> {
        message::write_keyword(&mut self.writer, message::IDENTITY).await?;
        let line = self.read_response_line().await?;
        line.trim()
            .parse()
            .with_context(|| format!("malformed identity response: {line:?}"))
    }

    /// Asks the relay for the other connected identities. Empty when this
    /// connection is alone.
    pub async fn list(&mut self) -> Result<Vec<u64>> {
        message::write_keyword(&mut self.writer, message::LIST).await?;
        let line = self.read_response_line().await?;
        parse_identity_list(&line)
    }

    /// Relays `body` to `recipients` and returns the verdict line: `DONE`
    /// on success, an `ERR ...` literal otherwise.
    pub async fn send(&mut self, recipients: &[u64], body: &[u8]) -> Result<String> {
        let frame = SendFrame {
            recipients: recipients.to_vec(),
            body: body.to_vec(),
        };
        message::write_frame(&mut self.writer, &frame.encode()).await?;
        self.read_response_line().await
    }

    /// Sends a bare keyword verbatim and returns the raw response line.
    pub async fn request(&mut self, keyword: &str) -> Result<String> {
        message::write_keyword(&mut self.writer, keyword).await?;
        self.read_response_line().await
    }

    /// Waits for the next message pushed to this connection.
    pub async fn next_incoming(&mut self) -> Result<IncomingFrame> {
        let keyword = message::read_keyword(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow!("connection closed while waiting for a message"))?;
        if keyword != message::INCOMING {
            bail!("expected an {} frame, got {keyword:?}", message::INCOMING);
        }
        Ok(IncomingFrame::decode(&mut self.reader).await?)
    }

    /// Shuts the write half down, telling the relay this side is done.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn read_response_line(&mut self) -> Result<String> {
        message::read_line(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow!("connection closed before a response arrived"))
    }
}

/// What the next plain response line from the relay answers.
enum Pending {
    Identity,
    List,
    Send,
    Other,
}

/// Runs the interactive client: commands typed on stdin, responses and
/// relayed messages rendered as they arrive.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut client = Client::connect(args.server).await?;
    let id = client.identity().await?;
    let Client {
        mut reader,
        mut writer,
    } = client;

    write_stdout(&format!("*** connected, your id: {id}")).await?;
    write_stdout("*** commands: IDENTITY, LIST, SEND, /quit").await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut pending = VecDeque::new();

    run_repl(&mut reader, &mut writer, &mut stdin, &mut input, &mut pending).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn run_repl(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    pending: &mut VecDeque<Pending>,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_line = message::read_line(reader) => {
                if !handle_server_line(server_line, reader, pending).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, stdin, writer, pending).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(
    line: Result<Option<String>, ProtocolError>,
    reader: &mut BufReader<OwnedReadHalf>,
    pending: &mut VecDeque<Pending>,
) -> Result<bool> {
    let line = match line? {
        Some(line) => line,
        None => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
    };

    if line.trim() == message::INCOMING {
        let frame = IncomingFrame::decode(reader).await?;
        let body = String::from_utf8_lossy(&frame.body);
        write_stdout(&format!("<{}> {body}", frame.sender)).await?;
        return Ok(true);
    }

    render_response(pending.pop_front(), &line).await?;
    Ok(true)
}

async fn render_response(pending: Option<Pending>, line: &str) -> io::Result<()> {
    if line == UNKNOWN_MESSAGE || line.starts_with("ERR ") {
        return write_stderr(&format!("!!! {line}")).await;
    }
    match pending {
        Some(Pending::Identity) => write_stdout(&format!("*** your id: {line}")).await,
        Some(Pending::List) if line.trim().is_empty() => {
            write_stdout("*** no one else is connected").await
        }
        Some(Pending::List) => write_stdout(&format!("*** connected: {line}")).await,
        Some(Pending::Send) | Some(Pending::Other) => {
            write_stdout(&format!("*** {line}")).await
        }
        None => write_stderr(&format!("!!! unexpected line: {line}")).await,
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    stdin: &mut BufReader<tokio::io::Stdin>,
    writer: &mut OwnedWriteHalf,
    pending: &mut VecDeque<Pending>,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim();
    if text.is_empty() {
        return Ok(true);
    }
    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** goodbye").await?;
        return Ok(false);
    }

    let keyword = text.to_uppercase();
    match keyword.as_str() {
        message::IDENTITY => {
            message::write_keyword(writer, message::IDENTITY).await?;
            pending.push_back(Pending::Identity);
        }
        message::LIST => {
            message::write_keyword(writer, message::LIST).await?;
            pending.push_back(Pending::List);
        }
        message::SEND => {
            if let Some(frame) = read_send_from_stdin(stdin).await? {
                message::write_frame(writer, &frame.encode()).await?;
                pending.push_back(Pending::Send);
            }
        }
        _ => {
            message::write_keyword(writer, &keyword).await?;
            pending.push_back(Pending::Other);
        }
    }
    Ok(true)
}

/// Prompts for the recipients and body lines of a `SEND`. Returns `None`
/// (sending nothing) when the recipients line does not parse, so a typo
/// never costs the session.
async fn read_send_from_stdin(
    stdin: &mut BufReader<tokio::io::Stdin>,
) -> Result<Option<SendFrame>> {
    write_stdout("*** recipients (comma separated):").await?;
    let recipients_line = read_stdin_line(stdin).await?;
    let recipients = match parse_identity_list(&recipients_line) {
        Ok(recipients) => recipients,
        Err(error) => {
            write_stderr(&format!("!!! {error}")).await?;
            return Ok(None);
        }
    };

    write_stdout("*** body:").await?;
    let body = read_stdin_line(stdin).await?;

    Ok(Some(SendFrame {
        recipients,
        body: body.into_bytes(),
    }))
}

async fn read_stdin_line(stdin: &mut BufReader<tokio::io::Stdin>) -> Result<String> {
    let mut line = String::new();
    let bytes_read = stdin.read_line(&mut line).await?;
    if bytes_read == 0 {
        bail!("stdin closed mid-command");
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

fn parse_identity_list(line: &str) -> Result<Vec<u64>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    line.split(',')
        .map(|field| {
            let field = field.trim();
            field
                .parse()
                .with_context(|| format!("malformed identity: {field:?}"))
        })
        .collect()
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
