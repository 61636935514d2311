//! Command-line argument parsing.

use clap::Parser;

/// vmrent daemon - inventory synchronization and rental sweeps
#[derive(Parser, Debug, Default)]
#[command(name = "vmrent-daemon")]
#[command(about = "vmrent daemon - inventory synchronization and rental sweeps")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "VMRENT_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "VMRENT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, env = "VMRENT_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Enable development mode (mock backends for every configured host)
    #[arg(long)]
    pub dev: bool,

    /// Run every sweep once and exit
    #[arg(long)]
    pub once: bool,
}
