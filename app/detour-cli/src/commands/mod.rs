//! CLI command implementations.

use clap::{Parser, Subcommand};

pub mod request;

/// detour - NAT detour client
#[derive(Parser)]
#[command(name = "detour")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Ask a daemon for a detour port to a remote endpoint
    Request(request::RequestArgs),
}
