//! Lease hook invoked by the DHCP service on every lease event.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dhcp_tftpd::config::DEFAULT_CONFIG_PATH;
use dhcp_tftpd::{Config, LeaseHookCommand, LeaseStore, Result, hook};

#[derive(Parser)]
#[command(name = "dhcp_leases")]
#[command(author, version, about = "Records DHCP lease events", long_about = None)]
struct Cli {
    #[arg(short, long, env = "DHCP_TFTPD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: LeaseHookCommand,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&cli.config)?;
    let mut store = LeaseStore::open(&config.leases_file).await?;
    let mut stdout = std::io::stdout().lock();
    hook::execute(cli.command, &mut store, &mut stdout).await
}
