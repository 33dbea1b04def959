//! Umbra relay broker binary

use clap::Parser;
use umbra_relay::RelayConfig;

#[derive(Parser)]
#[command(name = "umbra-relay")]
#[command(about = "Umbra relay broker — pairs peers and forwards opaque frames", long_about = None)]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:4600")]
    addr: String,

    /// Configuration file (TOML); flags override it
    #[arg(short, long)]
    config: Option<String>,

    /// Maximum concurrent pairings
    #[arg(long)]
    max_pairs: Option<usize>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str::<RelayConfig>(&raw)?
        }
        None => RelayConfig::default(),
    };

    config.bind_addr = cli.addr;
    if let Some(max_pairs) = cli.max_pairs {
        config.max_pairs = max_pairs;
    }
    config.validate();

    let server = umbra_relay::RelayServer::spawn(config).await?;
    tracing::info!("relay broker ready at {}", server.url());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown();
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("umbra_relay={level}").into()),
        )
        .init();
}
