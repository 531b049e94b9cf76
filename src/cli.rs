// src/cli.rs
//! CLI definitions for envstore
//!
//! The command implementations live in `main.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "envstore")]
#[command(author = "Envstore Contributors")]
#[command(version)]
#[command(about = "Build and serve reproducible conda environments", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML); built-in defaults when omitted
    #[arg(short, long, global = true, env = "ENVSTORE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database, store directory and token signing key
    Init,

    /// Run the HTTP API server
    Server,

    /// Run a worker pool that executes queued tasks
    Worker {
        /// Execute every due task once and exit
        #[arg(long)]
        drain: bool,
    },

    /// Mint a token with the server's signing key
    Token {
        /// Namespace the token holder administers
        #[arg(short, long)]
        primary_namespace: String,

        /// Extra binding, e.g. `team/*=developer` (repeatable)
        #[arg(short, long = "role-binding", value_name = "PATTERN=ROLE")]
        role_bindings: Vec<String>,

        /// Lifetime (e.g., "30d"); `[auth] token_expiry` when omitted
        #[arg(short, long)]
        expiration: Option<String>,
    },

    /// Read or write settings
    #[command(subcommand)]
    Settings(SettingsCommands),
}

#[derive(Subcommand)]
pub enum SettingsCommands {
    /// Print the resolved settings for a scope as JSON
    Get {
        #[arg(short, long)]
        namespace: Option<String>,
        #[arg(short, long, requires = "namespace")]
        environment: Option<String>,
    },

    /// Store overrides at a scope; values are JSON, bare words are strings
    Set {
        /// `key=value` pairs
        #[arg(required = true, value_name = "KEY=VALUE")]
        values: Vec<String>,
        #[arg(short, long)]
        namespace: Option<String>,
        #[arg(short, long, requires = "namespace")]
        environment: Option<String>,
    },
}
