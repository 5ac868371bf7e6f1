//! Error types for the forkdb server.

use crate::controller::LifecycleState;
use crate::session::InvalidBranchRef;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned by the server driver.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigErrors),

    /// The server could not start.
    #[error("server failed to start: {0}")]
    Start(#[from] StartError),

    /// The lifecycle controller was driven out of contract.
    #[error("lifecycle contract violated: {0}")]
    Controller(#[from] ControllerError),

    /// I/O error after startup.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The server task panicked or was aborted.
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Why a server run did not reach the running state.
///
/// Delivered to every `wait_for_start` caller, hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// The configuration was rejected before any socket was touched.
    #[error("invalid configuration: {0}")]
    Config(ConfigErrors),

    /// Another socket already owns the address.
    #[error("port {} already in use ({addr})", .addr.port())]
    PortInUse {
        /// Address the bind was attempted on.
        addr: SocketAddr,
    },

    /// Binding failed for any other reason.
    #[error("failed to bind {addr}: {message}")]
    Bind {
        /// Address the bind was attempted on.
        addr: SocketAddr,
        /// Kind of the underlying I/O error.
        kind: io::ErrorKind,
        /// Message of the underlying I/O error.
        message: String,
    },

    /// A stop was requested before the listener was bound.
    #[error("stop requested before the server started")]
    Cancelled,

    /// The server task went away without reporting an outcome.
    #[error("server task ended before reporting startup: {0}")]
    Aborted(String),
}

impl StartError {
    /// Classifies a bind failure on `addr`.
    pub(crate) fn bind(addr: SocketAddr, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::AddrInUse {
            StartError::PortInUse { addr }
        } else {
            StartError::Bind {
                addr,
                kind: err.kind(),
                message: err.to_string(),
            }
        }
    }

    /// Returns the configuration errors, if startup failed on validation.
    pub fn config_errors(&self) -> Option<&ConfigErrors> {
        match self {
            StartError::Config(errors) => Some(errors),
            _ => None,
        }
    }

    /// Returns true if startup failed while binding the listener.
    pub fn is_bind_error(&self) -> bool {
        matches!(self, StartError::PortInUse { .. } | StartError::Bind { .. })
    }
}

/// Misuse of the lifecycle controller.
///
/// These are defects in the caller or the driver, never expected at runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// A start outcome was already recorded for this run.
    #[error("start outcome already recorded")]
    StartAlreadySignaled,

    /// Close was already signalled for this run.
    #[error("close already signalled")]
    AlreadyClosed,

    /// The requested transition is not allowed from the current state.
    #[error("invalid lifecycle transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state.
        from: LifecycleState,
        /// Attempted target state.
        to: LifecycleState,
    },
}

/// A configuration field, as named in error reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConfigField {
    /// Listener host.
    Host,
    /// Listener port.
    Port,
    /// User name.
    User,
    /// Combined read/write timeout flag.
    Timeout,
    /// Read timeout.
    ReadTimeout,
    /// Write timeout.
    WriteTimeout,
    /// Log verbosity.
    LogLevel,
    /// Read-only flag.
    ReadOnly,
    /// Maximum concurrent connections.
    MaxConnections,
    /// Initial default branch.
    DefaultBranch,
    /// A flag key that is not recognised.
    Unknown(String),
}

impl ConfigField {
    /// Returns the field name used in messages.
    pub fn as_str(&self) -> &str {
        match self {
            ConfigField::Host => "host",
            ConfigField::Port => "port",
            ConfigField::User => "user",
            ConfigField::Timeout => "timeout",
            ConfigField::ReadTimeout => "read_timeout",
            ConfigField::WriteTimeout => "write_timeout",
            ConfigField::LogLevel => "log_level",
            ConfigField::ReadOnly => "read_only",
            ConfigField::MaxConnections => "max_connections",
            ConfigField::DefaultBranch => "default_branch",
            ConfigField::Unknown(key) => key,
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rejected configuration field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {reason}")]
pub struct ConfigError {
    /// The offending field.
    pub field: ConfigField,
    /// Human-readable reason, including the rejected value.
    pub reason: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    pub fn new(field: ConfigField, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Every field rejected while building one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigErrors(Vec<ConfigError>);

impl ConfigErrors {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Records an error.
    pub fn push(&mut self, error: ConfigError) {
        self.0.push(error);
    }

    /// Appends all errors from `other`.
    pub fn extend(&mut self, other: ConfigErrors) {
        self.0.extend(other.0);
    }

    /// Returns true if nothing was rejected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the individual errors.
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }

    /// Returns the rejected fields, in report order.
    pub fn fields(&self) -> Vec<&ConfigField> {
        self.0.iter().map(|e| &e.field).collect()
    }

    /// Returns true if `field` was rejected.
    pub fn contains(&self, field: &ConfigField) -> bool {
        self.0.iter().any(|e| &e.field == field)
    }

    /// Converts into a result: `Ok(value)` when empty.
    pub(crate) fn into_result<T>(self, value: T) -> Result<T, ConfigErrors> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl From<ConfigError> for ConfigErrors {
    fn from(error: ConfigError) -> Self {
        Self(vec![error])
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

/// Errors produced while executing one statement.
///
/// Reported to the client; never affects the server lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    /// The statement could not be parsed.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// A branch reference was malformed.
    #[error(transparent)]
    InvalidBranch(#[from] InvalidBranchRef),

    /// The branch or commit does not exist.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// A branch with this name already exists.
    #[error("branch already exists: {0}")]
    BranchExists(String),

    /// The server rejects writes.
    #[error("server is in read-only mode")]
    ReadOnly,

    /// Execution exceeded the configured timeout.
    #[error("statement exceeded timeout of {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The query engine does not handle this statement.
    #[error("unsupported statement: {0}")]
    Unsupported(String),

    /// Any other failure reported by the query engine.
    #[error("{0}")]
    Engine(String),
}

/// Errors that end a single connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Malformed or oversized line.
    #[error("protocol error: {0}")]
    Codec(#[from] LinesCodecError),

    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A response could not be written in time.
    #[error("write timed out after {}ms", .0.as_millis())]
    WriteTimeout(Duration),

    /// The handshake credentials were rejected.
    #[error("authentication failed for user '{0}'")]
    AuthenticationFailed(String),

    /// The client did not authenticate in time.
    #[error("no handshake within {}ms", .0.as_millis())]
    HandshakeTimeout(Duration),
}

/// Errors returned by [`crate::Client`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or oversized line.
    #[error("protocol error: {0}")]
    Codec(#[from] LinesCodecError),

    /// The server refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The server reported a statement error.
    #[error("statement failed: {0}")]
    Statement(String),

    /// The server sent something the client does not understand.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The server closed the connection.
    #[error("connection closed by server")]
    Closed,
}
