//! `sql-server` command implementation.

use clap::Args;
use forkdb_server::{
    Backend, ConfigDocument, ConfigErrors, ConfigSources, LogLevel, ServerConfig, ServerError,
    ServerHandle, StartError,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Errors that end the `sql-server` command.
#[derive(Error, Debug)]
pub enum CliError {
    /// The config file could not be read.
    #[error("failed to read config file {}: {source}", .path.display())]
    ReadConfig {
        /// Path that was read.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The config file is not a valid document.
    #[error("failed to parse config file {}: {source}", .path.display())]
    ParseConfig {
        /// Path that was read.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },

    /// One or more settings were rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigErrors),

    /// The server did not start.
    #[error("server failed to start: {0}")]
    Start(#[from] StartError),

    /// The server failed after starting.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The async runtime could not be created.
    #[error("failed to build runtime: {0}")]
    Runtime(#[from] io::Error),
}

/// Options of `forkdb sql-server`.
///
/// Values are kept as text so that validation reports every bad field at
/// once, the same way for flags and for the config file.
#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Host to bind (IP address or localhost)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short = 'P', long)]
    pub port: Option<String>,

    /// User clients authenticate as
    #[arg(short, long)]
    pub user: Option<String>,

    /// Password clients authenticate with
    #[arg(short, long)]
    pub password: Option<String>,

    /// Read and write timeout in seconds (0 disables)
    #[arg(short, long)]
    pub timeout: Option<String>,

    /// Log level (debug, info, warning, error, fatal)
    #[arg(short = 'l', long = "loglevel", alias = "log-level")]
    pub loglevel: Option<String>,

    /// Reject writes
    #[arg(short = 'r', long = "readonly", alias = "read-only")]
    pub readonly: bool,

    /// Maximum concurrent connections
    #[arg(long)]
    pub max_connections: Option<String>,

    /// Branch new connections start on
    #[arg(long)]
    pub default_branch: Option<String>,

    /// TOML config file; flags override its fields
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ServerArgs {
    /// Returns the flag pairs that were given, in a fixed order.
    pub fn flags(&self) -> Vec<(String, String)> {
        let given = |(key, value): (&str, &Option<String>)| {
            value.clone().map(|value| (key.to_string(), value))
        };

        let mut flags: Vec<_> = [
            ("host", &self.host),
            ("port", &self.port),
            ("user", &self.user),
            ("password", &self.password),
            ("timeout", &self.timeout),
            ("loglevel", &self.loglevel),
        ]
        .into_iter()
        .filter_map(given)
        .collect();
        if self.readonly {
            flags.push(("readonly".to_string(), String::new()));
        }
        flags.extend(
            [
                ("max-connections", &self.max_connections),
                ("default-branch", &self.default_branch),
            ]
            .into_iter()
            .filter_map(given),
        );
        flags
    }

    /// Collects the config file (if any) and the flags.
    pub fn sources(&self) -> Result<ConfigSources, CliError> {
        let mut sources = ConfigSources::from_flags(self.flags());
        if let Some(path) = &self.config {
            sources = sources.with_document(load_document(path)?);
        }
        Ok(sources)
    }
}

/// Reads a TOML config document.
pub fn load_document(path: &Path) -> Result<ConfigDocument, CliError> {
    let text = fs::read_to_string(path).map_err(|source| CliError::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| CliError::ParseConfig {
        path: path.to_path_buf(),
        source,
    })
}

/// Runs the server until Ctrl-C or SIGTERM.
pub fn run(args: ServerArgs) -> Result<(), CliError> {
    let config = args.sources()?.resolve()?;
    init_logging(config.log_level());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
fn init_logging(level: LogLevel) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.level_filter().into())
        .from_env_lossy();
    // A subscriber installed by an embedding process wins.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn serve(config: ServerConfig) -> Result<(), CliError> {
    let handle = ServerHandle::spawn(config, Backend::memory());

    let addr = match handle.wait_for_start().await {
        Ok(addr) => addr,
        Err(e) => {
            handle.wait_for_close().await;
            return Err(e.into());
        }
    };
    info!(%addr, "forkdb sql-server ready");

    shutdown_signal().await;
    handle.stop();
    handle.wait_for_close().await;
    handle.join().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkdb_server::{ConfigField, Host};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn config_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn read_only_flag_is_only_sent_when_set() {
        let args = ServerArgs::default();
        assert!(args.flags().is_empty());

        let args = ServerArgs {
            readonly: true,
            ..Default::default()
        };
        assert_eq!(args.flags(), vec![("readonly".to_string(), String::new())]);
    }

    #[test]
    fn config_file_with_flag_overrides() {
        let file = config_file(
            r#"
log_level = "debug"

[user]
name = "filed"

[listener]
host = "0.0.0.0"
port = 15300
read_timeout_millis = 2500
"#,
        );
        let args = ServerArgs {
            port: Some("15301".into()),
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let config = args.sources().unwrap().resolve().unwrap();
        assert_eq!(config.host(), Host::parse("0.0.0.0").unwrap());
        assert_eq!(config.port(), 15301);
        assert_eq!(config.user(), "filed");
        assert_eq!(config.read_timeout(), Duration::from_millis(2500));
        assert_eq!(config.log_level(), LogLevel::Debug);
    }

    #[test]
    fn missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = ServerArgs {
            config: Some(dir.path().join("absent.toml")),
            ..Default::default()
        };
        let err = args.sources().unwrap_err();
        assert!(matches!(err, CliError::ReadConfig { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn malformed_config_file() {
        let file = config_file("[listener]\nport = \"not a table");
        let err = load_document(file.path()).unwrap_err();
        assert!(matches!(err, CliError::ParseConfig { .. }));

        let file = config_file("[listener]\nbogus = 1\n");
        assert!(matches!(
            load_document(file.path()),
            Err(CliError::ParseConfig { .. })
        ));
    }

    #[test]
    fn invalid_values_fail_before_running() {
        let args = ServerArgs {
            port: Some("99999".into()),
            loglevel: Some("loud".into()),
            ..Default::default()
        };
        let err = run(args).unwrap_err();
        let CliError::Config(errors) = &err else {
            panic!("expected config error, got {err}");
        };
        assert!(errors.contains(&ConfigField::Port));
        assert!(errors.contains(&ConfigField::LogLevel));
        assert!(err.to_string().starts_with("invalid configuration"));
    }
}
