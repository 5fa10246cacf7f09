use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "stashproxy", about = "Caching forward HTTP proxy")]
pub struct Cli {
    /// Listening TCP port. Absent or unparseable values fall back to the configured default.
    pub port: Option<String>,
    /// Path to the runtime configuration file (defaults to ./stashproxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
