use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use message_relay::{
    cli::{Cli, Command},
    client,
    server::Server,
};

fn init_tracing(debug: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_filter = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            init_tracing(args.debug);

            let listener = TcpListener::bind(args.listen).await?;
            let server = Server::new(listener);
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => {
            init_tracing(false);
            client::run(args).await?;
        }
    }

    Ok(())
}
