use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dhcp_tftpd::config::DEFAULT_CONFIG_PATH;
use dhcp_tftpd::error::RESTART_EXIT_CODE;
use dhcp_tftpd::{
    CommandBuilder, Config, ConfigStore, ConfigWatcher, ControlServer, Error, FileStore,
    LeaseStore, ProcessSupervisor, ReconciliationLoop, Result, StoreDocument, control,
};

#[derive(Parser)]
#[command(name = "dhcp-tftpd")]
#[command(author, version, about = "Supervises the DHCP/TFTP service", long_about = None)]
struct Cli {
    #[arg(short, long, env = "DHCP_TFTPD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor (default).
    Run,
    ShowConfig,
    /// Print the service command line for the current store document.
    ShowCommand,
    /// Check a store document the way a write would be checked.
    Validate { file: PathBuf },
    ListLeases,
    ClearLeases,
    /// Ask a running supervisor to exit.
    Stop,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting supervisor with config: {:?}", cli.config);
            if let Err(run_error) = run(config).await {
                if run_error.is_fatal_at_startup() {
                    error!("{}", run_error);
                    std::process::exit(RESTART_EXIT_CODE);
                }
                return Err(run_error);
            }
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ShowCommand => {
            let mut store = FileStore::open(&config.store_path, config.store_settle())?;
            store.run().await?;
            let command = CommandBuilder::from_config(&config).build(&store.snapshot());
            println!("{}", command);
            Ok(())
        }
        Commands::Validate { file } => {
            let content = std::fs::read_to_string(&file)?;
            match StoreDocument::parse_validated(&content) {
                Ok(_) => {
                    println!("accepted");
                    Ok(())
                }
                Err(validation_error) => {
                    eprintln!("{}", validation_error);
                    std::process::exit(1);
                }
            }
        }
        Commands::ListLeases => {
            let store = LeaseStore::open(&config.leases_file).await?;
            let leases = store.list();

            if leases.is_empty() {
                println!("No active leases.");
            } else {
                println!(
                    "{:<18} {:<16} {:<24} {:<24} {:<16}",
                    "MAC Address", "IP Address", "Expires At", "Hostname", "Client ID"
                );
                println!("{}", "-".repeat(102));

                for lease in leases {
                    let expires = lease
                        .expires_at()
                        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                        .unwrap_or_else(|| "*".to_string());

                    println!(
                        "{:<18} {:<16} {:<24} {:<24} {:<16}",
                        lease.mac_address,
                        lease.ip_address.as_deref().unwrap_or("*"),
                        expires,
                        lease.client_hostname.as_deref().unwrap_or("*"),
                        lease.client_id.as_deref().unwrap_or("*"),
                    );
                }
            }

            Ok(())
        }
        Commands::ClearLeases => {
            let mut store = LeaseStore::open(&config.leases_file).await?;
            let count = store.clear().await?;
            println!("Cleared {} lease(s).", count);
            Ok(())
        }
        Commands::Stop => {
            control::send_command(&config.control_socket, "exit").await?;
            println!("Exit requested.");
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let store = FileStore::open(&config.store_path, config.store_settle())?;
    let leases = LeaseStore::open(&config.leases_file).await?;
    let control = ControlServer::bind(&config.control_socket)?;

    let reconciler = ReconciliationLoop::new(
        store,
        ProcessSupervisor::from_config(&config)?,
        CommandBuilder::from_config(&config),
        ConfigWatcher::new(config.poll_timeout()),
        leases,
        config.startup_backoff(),
    )
    .with_control(control);

    tokio::spawn(forward_signals(config.control_socket.clone()));
    reconciler.run().await
}

/// Turns SIGINT/SIGTERM into an `exit` control request so shutdown always
/// goes through the loop.
async fn forward_signals(socket: PathBuf) {
    if let Err(signal_error) = wait_for_signal().await {
        warn!("signal handling unavailable: {}", signal_error);
        return;
    }
    info!("Received shutdown signal, stopping supervisor...");
    if let Err(send_error) = control::send_command(&socket, "exit").await {
        error!("Failed to request exit: {}", send_error);
    }
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(Error::Io)?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map_err(Error::Io),
        _ = terminate.recv() => Ok(()),
    }
}
