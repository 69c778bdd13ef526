use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tensorloomd", version, about = "TensorLoom inference daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the inference server
    Serve {
        /// Path to a settings file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for HTTP, overriding the settings file
        #[arg(long)]
        http_addr: Option<String>,

        /// Model repository root, overriding the settings file
        #[arg(long)]
        repository: Option<PathBuf>,

        /// Log level (RUST_LOG)
        #[arg(long, default_value = "info")]
        log: String,
    },
}
