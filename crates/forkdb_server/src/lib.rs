//! # forkdb server core
//!
//! Lifecycle, configuration and branch-session core of the forkdb SQL server.
//!
//! This crate provides:
//! - Configuration merging and validation (flag pairs + structured document)
//! - A lifecycle controller with one-shot start/close signals
//! - The server driver (bind, accept loop, graceful shutdown)
//! - Per-connection branch sessions and the server-wide default branch
//! - A line-oriented wire front end and a matching client
//!
//! # Architecture
//!
//! The storage engine and the query engine are external collaborators,
//! reached through the [`BranchStore`] and [`QueryEngine`] traits. The
//! server owns everything between them and the socket:
//! - the listener and one task per connection
//! - one [`Session`] per connection, copied from the [`DefaultBranch`] at open
//! - the branch verbs (`active_branch()`, `checkout(...)`, `default_branch`)
//!
//! # Lifecycle
//!
//! ```rust,ignore
//! use forkdb_server::{Backend, ServerConfig, ServerHandle};
//!
//! let handle = ServerHandle::spawn(ServerConfig::default().with_port(15200), Backend::memory());
//! let addr = handle.wait_for_start().await?;
//! // ... serve clients at `addr` ...
//! handle.stop();
//! handle.wait_for_close().await;
//! ```
//!
//! `wait_for_start` returning an error means nothing is bound; `wait_for_close`
//! returning means the listener and every connection task are gone.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod config;
mod client;
mod controller;
mod dispatch;
mod driver;
mod engine;
mod error;
mod frontend;
mod session;
mod wire;

pub use client::Client;
pub use config::{
    ConfigDocument, ConfigSources, Host, LogLevel, PartialConfig, ServerConfig,
};
pub use controller::{LifecycleState, ServerController};
pub use dispatch::Dispatcher;
pub use driver::{serve, serve_sources, Backend, ServerHandle};
pub use engine::{
    BranchStore, MemoryBranchStore, QueryEngine, QueryResult, StatementContext,
    UnsupportedEngine,
};
pub use error::{
    ClientError, ClientResult, ConfigError, ConfigErrors, ConfigField, ConnectionError,
    ControllerError, ServerError, ServerResult, StartError, StatementError,
};
pub use session::{BranchRef, ConnectionId, DefaultBranch, InvalidBranchRef, Session};

/// Crate version, reported by `forkdb version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
