//! Per-source configuration records.

use super::{
    Host, LogLevel, ServerConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT, DEFAULT_SHUTDOWN_GRACE,
    DEFAULT_TIMEOUT, DEFAULT_USER,
};
use crate::error::{ConfigError, ConfigErrors, ConfigField};
use crate::session::BranchRef;
use std::time::Duration;

/// The validated contents of a single configuration source.
///
/// Every field is optional; unset fields fall through to the next source and
/// finally to the defaults in [`PartialConfig::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialConfig {
    /// Listener host.
    pub host: Option<Host>,
    /// Listener port.
    pub port: Option<u16>,
    /// User name.
    pub user: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Read timeout.
    pub read_timeout: Option<Duration>,
    /// Write timeout.
    pub write_timeout: Option<Duration>,
    /// Log verbosity.
    pub log_level: Option<LogLevel>,
    /// Read-only flag.
    pub read_only: Option<bool>,
    /// Maximum concurrent connections.
    pub max_connections: Option<usize>,
    /// Initial default branch.
    pub default_branch: Option<BranchRef>,
}

impl PartialConfig {
    /// Builds a record from ordered flag pairs.
    ///
    /// Recognised keys: `host`, `port`, `user`, `password`, `timeout`
    /// (seconds, sets both timeouts), `loglevel`/`log-level`,
    /// `readonly`/`read-only`, `max-connections`, `default-branch`.
    /// When a key repeats, the last value wins.
    pub fn from_flags<I, K, V>(flags: I) -> Result<Self, ConfigErrors>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut partial = Self::default();
        let mut errors = ConfigErrors::new();

        for (key, value) in flags {
            let value = value.as_ref();
            let applied = match key.as_ref() {
                "host" => Host::parse(value).map(|host| partial.host = Some(host)),
                "port" => parse_port(value).map(|port| partial.port = Some(port)),
                "user" => parse_user(value).map(|user| partial.user = Some(user)),
                "password" => {
                    partial.password = Some(value.to_string());
                    Ok(())
                }
                "timeout" => parse_timeout_secs(value).map(|timeout| {
                    partial.read_timeout = Some(timeout);
                    partial.write_timeout = Some(timeout);
                }),
                "loglevel" | "log-level" => value
                    .parse::<LogLevel>()
                    .map(|level| partial.log_level = Some(level)),
                "readonly" | "read-only" => {
                    parse_flag_bool(value).map(|on| partial.read_only = Some(on))
                }
                "max-connections" => parse_integer(ConfigField::MaxConnections, value)
                    .and_then(check_max_connections)
                    .map(|max| partial.max_connections = Some(max)),
                "default-branch" => {
                    parse_branch(value).map(|branch| partial.default_branch = Some(branch))
                }
                other => Err(ConfigError::new(
                    ConfigField::Unknown(other.to_string()),
                    "unrecognised flag",
                )),
            };
            if let Err(error) = applied {
                errors.push(error);
            }
        }

        errors.into_result(partial)
    }

    /// Layers `higher` over `self`, field by field.
    #[must_use]
    pub fn overlay(self, higher: PartialConfig) -> PartialConfig {
        PartialConfig {
            host: higher.host.or(self.host),
            port: higher.port.or(self.port),
            user: higher.user.or(self.user),
            password: higher.password.or(self.password),
            read_timeout: higher.read_timeout.or(self.read_timeout),
            write_timeout: higher.write_timeout.or(self.write_timeout),
            log_level: higher.log_level.or(self.log_level),
            read_only: higher.read_only.or(self.read_only),
            max_connections: higher.max_connections.or(self.max_connections),
            default_branch: higher.default_branch.or(self.default_branch),
        }
    }

    /// Fills unset fields with defaults.
    pub fn resolve(self) -> ServerConfig {
        ServerConfig {
            host: self.host.unwrap_or(Host::Localhost),
            port: self.port.unwrap_or(DEFAULT_PORT),
            user: self.user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            password: self.password.unwrap_or_default(),
            read_timeout: self.read_timeout.unwrap_or(DEFAULT_TIMEOUT),
            write_timeout: self.write_timeout.unwrap_or(DEFAULT_TIMEOUT),
            log_level: self.log_level.unwrap_or(LogLevel::Info),
            read_only: self.read_only.unwrap_or(false),
            max_connections: self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            default_branch: self.default_branch,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

pub(super) fn parse_integer(field: ConfigField, raw: &str) -> Result<i64, ConfigError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ConfigError::new(field, format!("'{raw}' is not an integer")))
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    parse_integer(ConfigField::Port, raw).and_then(check_port)
}

pub(super) fn check_port(port: i64) -> Result<u16, ConfigError> {
    u16::try_from(port)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| {
            ConfigError::new(
                ConfigField::Port,
                format!("'{port}' is out of range 1-65535"),
            )
        })
}

pub(super) fn parse_user(raw: &str) -> Result<String, ConfigError> {
    if raw.trim().is_empty() {
        Err(ConfigError::new(ConfigField::User, "must not be empty"))
    } else {
        Ok(raw.to_string())
    }
}

fn parse_timeout_secs(raw: &str) -> Result<Duration, ConfigError> {
    let secs = parse_integer(ConfigField::Timeout, raw)?;
    u64::try_from(secs)
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::new(ConfigField::Timeout, format!("'{secs}' is negative")))
}

pub(super) fn check_millis(field: ConfigField, millis: i64) -> Result<Duration, ConfigError> {
    u64::try_from(millis)
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::new(field, format!("'{millis}' is negative")))
}

pub(super) fn check_max_connections(max: i64) -> Result<usize, ConfigError> {
    usize::try_from(max)
        .ok()
        .filter(|max| *max > 0)
        .ok_or_else(|| {
            ConfigError::new(
                ConfigField::MaxConnections,
                format!("'{max}' is not a positive integer"),
            )
        })
}

pub(super) fn parse_branch(raw: &str) -> Result<BranchRef, ConfigError> {
    BranchRef::new(raw).map_err(|e| ConfigError::new(ConfigField::DefaultBranch, e.to_string()))
}

/// A bare `-r` arrives as an empty value and means "on".
fn parse_flag_bool(raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::new(
            ConfigField::ReadOnly,
            format!("'{raw}' is not a boolean"),
        )),
    }
}
