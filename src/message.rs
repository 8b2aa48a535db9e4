use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const IDENTITY: &str = "IDENTITY";
pub const LIST: &str = "LIST";
pub const SEND: &str = "SEND";
/// Pushed by the server to a recipient; never sent by clients.
pub const INCOMING: &str = "INCOMING";

/// Response line confirming a relayed `SEND`.
pub const DONE: &str = "DONE";
/// Response line for a keyword no handler is registered for.
pub const UNKNOWN_MESSAGE: &str = "UNKNOWN MESSAGE";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Errors raised while decoding frames off the wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream ended in the middle of a frame.
    #[error("stream ended mid-frame")]
    IncompleteFrame,
    /// A recipient field was not an unsigned decimal integer.
    #[error("invalid recipient field: {0:?}")]
    InvalidRecipient(String),
    /// The sender field of a pushed message was not an unsigned decimal integer.
    #[error("invalid sender field: {0:?}")]
    InvalidSender(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reads one command keyword line, trimmed of surrounding whitespace and
/// upper-cased. `Ok(None)` is a clean end of stream.
pub async fn read_keyword<R>(reader: &mut R) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader).await? {
        Some(line) => Ok(Some(line.trim().to_uppercase())),
        None => Ok(None),
    }
}

/// Reads one newline-terminated line without its terminator. `Ok(None)`
/// means the stream ended before any byte of the line arrived; ending
/// mid-line is an incomplete frame.
pub(crate) async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(ProtocolError::IncompleteFrame);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Writes a bare keyword frame (`IDENTITY\n`, `LIST\n`) and flushes it.
pub async fn write_keyword<W>(writer: &mut W, keyword: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(keyword.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a pre-encoded frame and flushes so the peer sees it promptly.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// A relay request: recipient identities plus an opaque single-line body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFrame {
    pub recipients: Vec<u64>,
    pub body: Vec<u8>,
}

impl SendFrame {
    /// Encodes the full frame, keyword line included. An empty recipient
    /// list encodes to an empty second line.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = format!("{SEND}\n{}\n", join_ids(&self.recipients)).into_bytes();
        frame.extend_from_slice(&self.body);
        frame.push(b'\n');
        frame
    }

    /// Decodes the recipient and body lines that follow a `SEND` keyword.
    /// An entirely empty recipient line decodes to zero recipients; an
    /// empty or non-numeric field among others is an invalid recipient.
    pub async fn decode<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = read_line(reader)
            .await?
            .ok_or(ProtocolError::IncompleteFrame)?;
        let recipients = parse_recipients(&line)?;
        let body = read_body(reader).await?;
        Ok(Self { recipients, body })
    }
}

/// A server-pushed message: the sender's identity plus the relayed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFrame {
    pub sender: u64,
    pub body: Vec<u8>,
}

impl IncomingFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = format!("{INCOMING}\n{}\n", self.sender).into_bytes();
        frame.extend_from_slice(&self.body);
        frame.push(b'\n');
        frame
    }

    /// Decodes the sender and body lines that follow an `INCOMING` keyword.
    pub async fn decode<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = read_line(reader)
            .await?
            .ok_or(ProtocolError::IncompleteFrame)?;
        let field = line.trim();
        let sender = field
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidSender(field.to_string()))?;
        let body = read_body(reader).await?;
        Ok(Self { sender, body })
    }
}

/// Joins identities with commas: the list encoding shared by `LIST`
/// responses and `SEND` recipient lines.
pub(crate) fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_recipients(line: &str) -> Result<Vec<u64>, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    line.split(',')
        .map(|field| {
            let field = field.trim();
            field
                .parse::<u64>()
                .map_err(|_| ProtocolError::InvalidRecipient(field.to_string()))
        })
        .collect()
}

/// Reads the body line as raw bytes, stripping only the terminating newline
/// (and a carriage return preceding it). Anything else stays verbatim.
async fn read_body<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let bytes = reader.read_until(b'\n', &mut body).await?;
    if bytes == 0 || body.pop() != Some(b'\n') {
        return Err(ProtocolError::IncompleteFrame);
    }
    if body.last() == Some(&b'\r') {
        body.pop();
    }
    Ok(body)
}
