use std::{
    collections::HashMap,
    future::Future,
    io,
    sync::{Arc, RwLock},
};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncWriteExt},
    sync::Mutex,
};
use tracing::debug;

use crate::{
    message::{self, ProtocolError, SendFrame},
    registry::{Registry, SessionId, SessionWriter},
};

/// Largest recipient set a single `SEND` may address.
pub const MAX_RECIPIENTS: usize = 255;
/// Largest body a single `SEND` may carry, in bytes.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Errors that interrupt or end one session. Only `Validation` is
/// recoverable: the session loop reports it on the wire and keeps reading.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Request-level violations. The `Display` text is the exact line reported
/// to the client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("ERR RECIPIENTS 1-255")]
    RecipientCount,
    #[error("ERR TOO LARGE BODY 1M")]
    BodyTooLarge,
}

pub type HandlerResult = Result<(), SessionError>;

/// A boxed async command handler. Handlers receive an owned [`Context`]
/// clone and may read the rest of their frame through it.
pub type HandlerFn = Arc<dyn Fn(Context) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

type SessionReader = Arc<Mutex<Box<dyn AsyncBufRead + Send + Unpin>>>;

/// Wraps a plain async function (or closure returning a future) as a
/// dispatch-table entry.
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Per-session state handed to every handler: the session's identity plus
/// shared handles to its transport halves and the registry. Cloning is
/// cheap; dispatch clones it once per command.
#[derive(Clone)]
pub struct Context {
    id: SessionId,
    reader: SessionReader,
    writer: SessionWriter,
    registry: Arc<Registry>,
}

impl Context {
    pub fn new(
        id: SessionId,
        reader: impl AsyncBufRead + Send + Unpin + 'static,
        writer: SessionWriter,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            id,
            reader: Arc::new(Mutex::new(Box::new(reader))),
            writer,
            registry,
        }
    }

    /// The identity the registry assigned to this session.
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Reads the next command keyword; `Ok(None)` means the peer closed.
    pub(crate) async fn read_keyword(&self) -> Result<Option<String>, ProtocolError> {
        let mut reader = self.reader.lock().await;
        message::read_keyword(&mut *reader).await
    }

    /// Decodes the payload lines of a `SEND` frame from this session's
    /// stream.
    pub(crate) async fn read_send_frame(&self) -> Result<SendFrame, ProtocolError> {
        let mut reader = self.reader.lock().await;
        SendFrame::decode(&mut *reader).await
    }

    /// Writes one response line and flushes it. The writer lock spans the
    /// whole line, so responses never interleave with a concurrent fan-out
    /// to this session.
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Keyword-indexed dispatch table. Lookups take the shared lock and
/// registration the exclusive one, so keywords may be added or replaced
/// while sessions are live; the last registration for a keyword wins.
/// Unresolved keywords fall back to the unknown-command handler, which is
/// not itself an entry and so cannot be unregistered.
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, HandlerFn>>,
    fallback: HandlerFn,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            fallback: handler(handle_unknown),
        }
    }

    /// Installs (or replaces) the handler for a keyword.
    pub fn register(&self, keyword: impl Into<String>, handler: HandlerFn) {
        self.handlers.write().unwrap().insert(keyword.into(), handler);
    }

    fn resolve(&self, keyword: &str) -> HandlerFn {
        self.handlers
            .read()
            .unwrap()
            .get(keyword)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Runs the handler registered for `keyword` against one session.
    pub async fn dispatch(&self, keyword: &str, ctx: Context) -> HandlerResult {
        let handler = self.resolve(keyword);
        handler(ctx).await
    }
}

/// Installs the built-in command handlers into a table.
pub(crate) fn register_builtins(table: &HandlerTable) {
    table.register(message::IDENTITY, handler(handle_identity));
    table.register(message::LIST, handler(handle_list));
    table.register(message::SEND, handler(handle_send));
}

/// `IDENTITY`: reply with the session's own identity on one line.
async fn handle_identity(ctx: Context) -> HandlerResult {
    ctx.write_line(&ctx.id().to_string()).await?;
    Ok(())
}

/// `LIST`: reply with every other registered identity, comma separated.
/// A session with no peers gets an empty line.
async fn handle_list(ctx: Context) -> HandlerResult {
    let mut others: Vec<SessionId> = ctx
        .registry()
        .identities()
        .await
        .into_iter()
        .filter(|&id| id != ctx.id())
        .collect();
    others.sort_unstable();
    ctx.write_line(&message::join_ids(&others)).await?;
    Ok(())
}

/// `SEND`: decode the recipient and body lines, enforce the limits, relay
/// the body, then confirm. The payload is consumed before validation so a
/// rejected frame leaves the stream aligned on the next keyword.
async fn handle_send(ctx: Context) -> HandlerResult {
    let frame = ctx.read_send_frame().await?;
    if frame.recipients.is_empty() || frame.recipients.len() > MAX_RECIPIENTS {
        return Err(ValidationError::RecipientCount.into());
    }
    if frame.body.len() > MAX_BODY_BYTES {
        return Err(ValidationError::BodyTooLarge.into());
    }

    let delivered = ctx
        .registry()
        .broadcast(ctx.id(), &frame.recipients, &frame.body)
        .await;
    debug!(
        sender = ctx.id(),
        recipients = frame.recipients.len(),
        delivered,
        "relayed message"
    );
    ctx.write_line(message::DONE).await?;
    Ok(())
}

/// Fallback for keywords with no registered handler.
async fn handle_unknown(ctx: Context) -> HandlerResult {
    ctx.write_line(message::UNKNOWN_MESSAGE).await?;
    Ok(())
}
