//! forkdb CLI
//!
//! Command-line entry point for the forkdb SQL server.
//!
//! # Commands
//!
//! - `sql-server` - Run the SQL server until Ctrl-C or SIGTERM
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

/// forkdb command-line tools.
#[derive(Parser)]
#[command(name = "forkdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SQL server
    SqlServer(commands::sql_server::ServerArgs),

    /// Show version information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::SqlServer(args) => commands::sql_server::run(args),
        Commands::Version => {
            println!("forkdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("forkdb server v{}", forkdb_server::VERSION);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("forkdb: {e}");
            ExitCode::FAILURE
        }
    }
}
