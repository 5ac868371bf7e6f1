//! Structured configuration document and source merging.

use super::partial::{
    check_max_connections, check_millis, check_port, parse_branch, parse_user,
};
use super::{Host, LogLevel, PartialConfig, ServerConfig};
use crate::error::{ConfigErrors, ConfigField};
use serde::Deserialize;

/// A structured configuration document.
///
/// ```toml
/// log_level = "info"
///
/// [behavior]
/// read_only = true
///
/// [user]
/// name = "username"
/// password = "password"
///
/// [listener]
/// host = "localhost"
/// port = 15200
/// read_timeout_millis = 5000
/// write_timeout_millis = 5000
/// ```
///
/// Numbers are kept as `i64` so that range checks report a config field
/// instead of a deserializer error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigDocument {
    /// Log verbosity token.
    pub log_level: Option<String>,
    /// `[behavior]` group.
    pub behavior: BehaviorSection,
    /// `[user]` group.
    pub user: UserSection,
    /// `[listener]` group.
    pub listener: ListenerSection,
}

/// The `[behavior]` group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BehaviorSection {
    /// Reject writes.
    pub read_only: Option<bool>,
    /// Initial default branch.
    pub default_branch: Option<String>,
}

/// The `[user]` group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserSection {
    /// User name.
    pub name: Option<String>,
    /// Password.
    pub password: Option<String>,
}

/// The `[listener]` group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerSection {
    /// Host to bind.
    pub host: Option<String>,
    /// Port to bind.
    pub port: Option<i64>,
    /// Statement timeout in milliseconds.
    pub read_timeout_millis: Option<i64>,
    /// Response write timeout in milliseconds.
    pub write_timeout_millis: Option<i64>,
    /// Maximum concurrent connections.
    pub max_connections: Option<i64>,
}

impl PartialConfig {
    /// Builds a record from a structured document.
    pub fn from_document(document: &ConfigDocument) -> Result<Self, ConfigErrors> {
        let mut partial = PartialConfig::default();
        let mut errors = ConfigErrors::new();

        macro_rules! apply {
            ($slot:expr, $result:expr) => {
                match $result {
                    Ok(value) => $slot = Some(value),
                    Err(error) => errors.push(error),
                }
            };
        }

        if let Some(level) = &document.log_level {
            apply!(partial.log_level, level.parse::<LogLevel>());
        }

        partial.read_only = document.behavior.read_only;
        if let Some(branch) = &document.behavior.default_branch {
            apply!(partial.default_branch, parse_branch(branch));
        }

        if let Some(name) = &document.user.name {
            apply!(partial.user, parse_user(name));
        }
        partial.password = document.user.password.clone();

        let listener = &document.listener;
        if let Some(host) = &listener.host {
            apply!(partial.host, Host::parse(host));
        }
        if let Some(port) = listener.port {
            apply!(partial.port, check_port(port));
        }
        if let Some(millis) = listener.read_timeout_millis {
            apply!(
                partial.read_timeout,
                check_millis(ConfigField::ReadTimeout, millis)
            );
        }
        if let Some(millis) = listener.write_timeout_millis {
            apply!(
                partial.write_timeout,
                check_millis(ConfigField::WriteTimeout, millis)
            );
        }
        if let Some(max) = listener.max_connections {
            apply!(partial.max_connections, check_max_connections(max));
        }

        errors.into_result(partial)
    }
}

/// The raw inputs of one server run.
///
/// Flags take precedence over the document field by field; fields set by
/// neither fall back to defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Structured document, if one was supplied.
    pub document: Option<ConfigDocument>,
    /// Ordered flag pairs.
    pub flags: Vec<(String, String)>,
}

impl ConfigSources {
    /// Creates empty sources (every field defaulted).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates sources from flag pairs only.
    pub fn from_flags<I, K, V>(flags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            document: None,
            flags: flags
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Sets the document.
    #[must_use]
    pub fn with_document(mut self, document: ConfigDocument) -> Self {
        self.document = Some(document);
        self
    }

    /// Appends a flag pair.
    #[must_use]
    pub fn with_flag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.push((key.into(), value.into()));
        self
    }

    /// Validates both sources and merges them into a configuration.
    ///
    /// Failures from both sources are reported together.
    pub fn resolve(&self) -> Result<ServerConfig, ConfigErrors> {
        let mut errors = ConfigErrors::new();

        let document = match &self.document {
            Some(document) => PartialConfig::from_document(document).unwrap_or_else(|e| {
                errors.extend(e);
                PartialConfig::default()
            }),
            None => PartialConfig::default(),
        };
        let flags = PartialConfig::from_flags(self.flags.iter().map(|(k, v)| (k, v)))
            .unwrap_or_else(|e| {
                errors.extend(e);
                PartialConfig::default()
            });

        errors.into_result(())?;
        Ok(document.overlay(flags).resolve())
    }
}
