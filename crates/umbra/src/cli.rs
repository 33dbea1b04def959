//! Command-line interface definition

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Umbra — post-quantum mesh VPN
#[derive(Parser)]
#[command(name = "umbra", version, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a node identity (no-op if one exists)
    Keygen(KeygenArgs),
    /// Export the public identity bundle for sharing with peers
    Export(ExportArgs),
    /// Bring a tunnel up
    Up(UpArgs),
    /// Show this node's identity and keystore state
    Status(StatusArgs),
}

#[derive(Args)]
pub struct KeygenArgs {
    /// Keystore directory
    #[arg(short, long, default_value_os_t = default_keystore())]
    pub keystore: PathBuf,

    /// Regenerate even if an identity exists (the old identity is lost)
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct ExportArgs {
    /// Keystore directory
    #[arg(short, long, default_value_os_t = default_keystore())]
    pub keystore: PathBuf,

    /// Output path for the public bundle
    #[arg(short, long)]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct UpArgs {
    /// Keystore directory
    #[arg(short, long, default_value_os_t = default_keystore())]
    pub keystore: PathBuf,

    /// Configuration file (TOML); flags override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Peer public bundle (from `umbra export`)
    #[arg(short, long)]
    pub peer: PathBuf,

    /// Dial the peer directly at this address
    #[arg(long, conflicts_with_all = ["listen", "relay"])]
    pub connect: Option<SocketAddr>,

    /// Listen for the peer on this address
    #[arg(long, conflicts_with_all = ["connect", "relay"])]
    pub listen: Option<SocketAddr>,

    /// Meet the peer through this relay broker (ws://host:port)
    #[arg(long, requires = "token")]
    pub relay: Option<String>,

    /// Pairing token for the relay (64 hex chars)
    #[arg(long)]
    pub token: Option<String>,

    /// Answer the handshake instead of initiating (relay mode)
    #[arg(long)]
    pub answer: bool,

    /// Bind a direct-path listener for relay→direct migration
    #[arg(long)]
    pub direct_port: Option<u16>,

    /// Print a status snapshot as JSON every N seconds (0 = off)
    #[arg(long, default_value_t = 10)]
    pub status_interval: u64,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Keystore directory
    #[arg(short, long, default_value_os_t = default_keystore())]
    pub keystore: PathBuf,

    /// Emit JSON
    #[arg(long)]
    pub json: bool,
}

fn default_keystore() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".umbra")
        .join("keys")
}
