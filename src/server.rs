use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    handler::{self, Context, HandlerFn, HandlerTable, SessionError},
    registry::{Registry, SessionWriter},
};

/// Accepts connections and runs one session task per client.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    handlers: Arc<HandlerTable>,
}

impl Server {
    /// Wraps a bound listener and installs the built-in `IDENTITY`, `LIST`,
    /// and `SEND` handlers.
    pub fn new(listener: TcpListener) -> Self {
        let handlers = HandlerTable::new();
        handler::register_builtins(&handlers);
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            handlers: Arc::new(handlers),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Installs (or replaces) the handler for a command keyword. Takes
    /// effect from the next dispatch on every live session.
    pub fn register_handler(&self, keyword: impl Into<String>, handler: HandlerFn) {
        self.handlers.register(keyword, handler);
    }

    /// Accepts connections until `shutdown` completes. Sessions already
    /// running drain on their own once the listener is dropped.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            handlers,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, &handlers);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
    handlers: &Arc<HandlerTable>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, registry, handlers),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    handlers: &Arc<HandlerTable>,
) {
    let registry = Arc::clone(registry);
    let handlers = Arc::clone(handlers);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, registry, handlers).await {
            warn!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}

/// Drives one connection from registration to teardown. Fatal errors
/// deregister the session before the socket is shut down.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    handlers: Arc<HandlerTable>,
) -> Result<(), SessionError> {
    let (reader, writer) = stream.into_split();
    let writer: SessionWriter = Arc::new(Mutex::new(Box::new(writer)));

    let id = registry.register(Arc::clone(&writer)).await;
    info!(peer = %peer, session = id, "session registered");

    let ctx = Context::new(
        id,
        BufReader::new(reader),
        Arc::clone(&writer),
        Arc::clone(&registry),
    );
    let result = read_commands(&handlers, &ctx).await;

    registry.deregister(id).await;
    info!(session = id, "session deregistered");
    shutdown_writer(&writer).await;

    result
}

/// Reads keywords and dispatches them until the peer goes away or a fatal
/// error ends the session. Validation failures are reported on the wire
/// and the loop keeps reading.
async fn read_commands(handlers: &HandlerTable, ctx: &Context) -> Result<(), SessionError> {
    loop {
        let keyword = match ctx.read_keyword().await? {
            Some(keyword) => keyword,
            None => return Ok(()),
        };
        debug!(session = ctx.id(), keyword, "dispatching command");

        match handlers.dispatch(&keyword, ctx.clone()).await {
            Ok(()) => {}
            Err(SessionError::Validation(violation)) => {
                debug!(session = ctx.id(), %violation, "rejected command");
                ctx.write_line(&violation.to_string()).await?;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn shutdown_writer(writer: &SessionWriter) {
    let mut writer = writer.lock().await;
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shut down session writer");
    }
}
