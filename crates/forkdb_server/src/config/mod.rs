//! Server configuration.
//!
//! A [`ServerConfig`] is produced once per server run, either through the
//! `with_*` builders or by resolving [`ConfigSources`] (flag pairs layered over
//! a [`ConfigDocument`]). It is never mutated afterwards: the builders consume
//! the value and return a new one.

mod partial;
mod sources;

pub use partial::PartialConfig;
pub use sources::{BehaviorSection, ConfigDocument, ConfigSources, ListenerSection, UserSection};

use crate::error::{ConfigError, ConfigErrors, ConfigField};
use crate::session::BranchRef;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Default listener port.
pub const DEFAULT_PORT: u16 = 3306;
/// Default user name.
pub const DEFAULT_USER: &str = "root";
/// Default read and write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Default limit on concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
/// Handshake deadline used when the read timeout is disabled.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time in-flight statements get to finish once a stop is requested.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Host the listener binds to.
///
/// Only IP literals and the `localhost` alias are accepted, so binding never
/// depends on name resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Host {
    /// The `localhost` alias, bound as 127.0.0.1.
    Localhost,
    /// An IPv4 or IPv6 literal.
    Ip(IpAddr),
}

impl Host {
    /// Parses a host token.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let token = raw.trim();
        if token.eq_ignore_ascii_case("localhost") {
            return Ok(Host::Localhost);
        }

        let literal = token
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(token);
        literal.parse::<IpAddr>().map(Host::Ip).map_err(|_| {
            ConfigError::new(
                ConfigField::Host,
                format!("'{raw}' is not an IP address or a recognised host alias"),
            )
        })
    }

    /// Returns the address to bind.
    pub fn ip(&self) -> IpAddr {
        match self {
            Host::Localhost => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Host::Ip(ip) => *ip,
        }
    }
}

impl FromStr for Host {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Host::parse(s)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Localhost => f.write_str("localhost"),
            Host::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogLevel {
    /// Everything, including per-statement events.
    Debug,
    /// Lifecycle and connection events.
    Info,
    /// Recoverable problems.
    Warning,
    /// Failures.
    Error,
    /// Only failures that end the server.
    Fatal,
}

impl LogLevel {
    /// All accepted levels.
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Fatal,
    ];

    /// Returns the canonical token.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }

    /// Returns the tracing filter for this level.
    ///
    /// tracing has no level above `ERROR`, so `fatal` shares it.
    pub fn level_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                ConfigError::new(
                    ConfigField::LogLevel,
                    format!(
                        "'{s}' is not one of debug, info, warning, error, fatal"
                    ),
                )
            })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, immutable configuration for one server run.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerConfig {
    host: Host,
    port: u16,
    user: String,
    password: String,
    read_timeout: Duration,
    write_timeout: Duration,
    log_level: LogLevel,
    read_only: bool,
    max_connections: usize,
    default_branch: Option<BranchRef>,
    shutdown_grace: Duration,
}

impl ServerConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the listener host.
    pub fn host(&self) -> Host {
        self.host
    }

    /// Returns the listener port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the address the listener binds.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host.ip(), self.port)
    }

    /// Returns the user clients authenticate as.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the password clients authenticate with.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Returns the read timeout (zero = none).
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Returns the write timeout (zero = none).
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Returns the log verbosity.
    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Returns true if the server rejects writes.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the limit on concurrent connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Returns the configured initial default branch, if any.
    pub fn default_branch(&self) -> Option<&BranchRef> {
        self.default_branch.as_ref()
    }

    /// Returns how long in-flight statements may run after a stop request.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Time limit for executing one statement.
    pub(crate) fn statement_limit(&self) -> Option<Duration> {
        non_zero(self.read_timeout)
    }

    /// Time a new connection gets to authenticate. Never unbounded.
    pub(crate) fn handshake_limit(&self) -> Duration {
        self.statement_limit().unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT)
    }

    /// Time limit for writing one response.
    pub(crate) fn write_limit(&self) -> Option<Duration> {
        non_zero(self.write_timeout)
    }

    /// Sets the listener host.
    #[must_use]
    pub fn with_host(mut self, host: Host) -> Self {
        self.host = host;
        self
    }

    /// Sets the listener port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the user name.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Sets the password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Sets both the read and the write timeout.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_read_timeout(timeout).with_write_timeout(timeout)
    }

    /// Sets the read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the write timeout.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the log verbosity.
    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets the limit on concurrent connections.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the initial default branch.
    #[must_use]
    pub fn with_default_branch(mut self, branch: BranchRef) -> Self {
        self.default_branch = Some(branch);
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Checks the invariants the builders cannot enforce by type.
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        let mut errors = ConfigErrors::new();
        if self.port == 0 {
            errors.push(ConfigError::new(
                ConfigField::Port,
                "'0' is out of range 1-65535",
            ));
        }
        if self.user.trim().is_empty() {
            errors.push(ConfigError::new(ConfigField::User, "must not be empty"));
        }
        if self.max_connections == 0 {
            errors.push(ConfigError::new(
                ConfigField::MaxConnections,
                "must be a positive integer",
            ));
        }
        errors.into_result(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Host::Localhost,
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: String::new(),
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            log_level: LogLevel::Info,
            read_only: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            default_branch: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("log_level", &self.log_level)
            .field("read_only", &self.read_only)
            .field("max_connections", &self.max_connections)
            .field("default_branch", &self.default_branch)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host(), Host::Localhost);
        assert_eq!(config.port(), 3306);
        assert_eq!(config.user(), "root");
        assert_eq!(config.password(), "");
        assert_eq!(config.read_timeout(), Duration::from_secs(30));
        assert_eq!(config.log_level(), LogLevel::Info);
        assert!(!config.read_only());
        assert_eq!(config.max_connections(), 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_host(Host::parse("127.0.0.1").unwrap())
            .with_port(15400)
            .with_user("testusernamE")
            .with_password("hunter2")
            .with_timeout(Duration::from_secs(4))
            .with_read_only(true);

        assert_eq!(config.bind_addr(), "127.0.0.1:15400".parse().unwrap());
        assert_eq!(config.user(), "testusernamE");
        assert_eq!(config.password(), "hunter2");
        assert_eq!(config.read_timeout(), Duration::from_secs(4));
        assert_eq!(config.write_timeout(), Duration::from_secs(4));
        assert!(config.read_only());
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let config = ServerConfig::new().with_timeout(Duration::ZERO);
        assert_eq!(config.statement_limit(), None);
        assert_eq!(config.write_limit(), None);

        let config = ServerConfig::new().with_read_timeout(Duration::from_millis(5));
        assert_eq!(config.statement_limit(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn handshake_is_always_bounded() {
        let config = ServerConfig::new().with_read_timeout(Duration::from_millis(50));
        assert_eq!(config.handshake_limit(), Duration::from_millis(50));

        let config = ServerConfig::new().with_timeout(Duration::ZERO);
        assert_eq!(config.handshake_limit(), DEFAULT_HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn validate_reports_every_field() {
        let config = ServerConfig::new()
            .with_port(0)
            .with_user("")
            .with_max_connections(0);
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&ConfigField::Port));
        assert!(errors.contains(&ConfigField::User));
        assert!(errors.contains(&ConfigField::MaxConnections));
    }

    #[test]
    fn host_parsing() {
        assert_eq!(Host::parse("localhost").unwrap(), Host::Localhost);
        assert_eq!(Host::parse("LocalHost").unwrap(), Host::Localhost);
        assert_eq!(
            Host::parse("0.0.0.0").unwrap().ip(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
        assert_eq!(
            Host::parse("[::1]").unwrap().ip(),
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        );
        assert_eq!(Host::parse("::1").unwrap(), Host::parse("[::1]").unwrap());

        for bad in ["127.0.0.0.1", "loclahost", "", "256.1.1.1", "example.com"] {
            let err = Host::parse(bad).unwrap_err();
            assert_eq!(err.field, ConfigField::Host, "{bad:?}");
        }
    }

    #[test]
    fn localhost_binds_ipv4_loopback() {
        let config = ServerConfig::new().with_port(15401);
        assert_eq!(config.bind_addr(), "127.0.0.1:15401".parse().unwrap());
    }

    #[test]
    fn log_level_tokens() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("Fatal".parse::<LogLevel>().unwrap(), LogLevel::Fatal);
        assert_eq!(LogLevel::Fatal.level_filter(), LevelFilter::ERROR);

        let err = "everything".parse::<LogLevel>().unwrap_err();
        assert_eq!(err.field, ConfigField::LogLevel);
        assert!(err.reason.contains("everything"));
    }

    #[test]
    fn debug_redacts_password() {
        let config = ServerConfig::new().with_password("hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
