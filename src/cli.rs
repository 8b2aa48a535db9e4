use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Serve(ServeArgs),
    /// Connect to a relay server and exchange messages interactively.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral
    /// port.
    #[arg(long, default_value = "127.0.0.1:50000")]
    pub listen: SocketAddr,

    /// Log every dispatched command, not just session lifecycle.
    #[arg(long)]
    pub debug: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay server to connect to.
    #[arg(long, default_value = "127.0.0.1:50000")]
    pub server: SocketAddr,
}
