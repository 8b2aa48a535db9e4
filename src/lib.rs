//! Multi-client TCP message relay.
//!
//! See `README.md` for an overview, usage instructions, and the line-based
//! wire protocol. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`server`] accepts TCP connections, runs one session task per client,
//!   and dispatches decoded commands through a [`handler::HandlerTable`].
//! - [`handler`] holds the keyword-to-handler dispatch table, the built-in
//!   `IDENTITY`/`LIST`/`SEND` handlers, and the session error taxonomy.
//! - [`registry`] tracks live sessions and fans relayed messages out to
//!   their write halves.
//! - [`message`] provides the line-oriented wire codec plus helpers for
//!   async reads and writes.
//! - [`client`] offers a typed client handle and the interactive terminal
//!   client built on it.
//!
//! Integration and unit tests use this crate directly to exercise the
//! session state machine and wire protocol.

pub mod cli;
pub mod client;
pub mod handler;
pub mod message;
pub mod registry;
pub mod server;
