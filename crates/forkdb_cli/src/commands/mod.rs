//! CLI command implementations.

pub mod sql_server;
