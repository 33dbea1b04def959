//! Umbra CLI — post-quantum mesh VPN daemon

#![forbid(unsafe_code)]

mod cli;
mod commands;
mod config;
mod logging;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    // Keep key material out of core dumps before any key is loaded
    if let Err(e) = umbra_crypto::init() {
        tracing::warn!("process hardening unavailable: {}", e);
    }

    let result = match cli.command {
        Commands::Keygen(args) => commands::keygen::run(args),
        Commands::Export(args) => commands::keygen::export(args),
        Commands::Up(args) => commands::up::run(args).await,
        Commands::Status(args) => commands::status::run(args),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
