//! Lease hook commands.
//!
//! The service runs the hook as `<event> <mac> <ip> [<hostname>] [<client-id>]`
//! and passes the lease expiry in `DNSMASQ_LEASE_EXPIRES`. Each event
//! decodes into one [`LeaseHookCommand`] variant, so the fields present are
//! known from the variant rather than from the argument count.

use std::io::Write;

use clap::{Args, Subcommand};
use tracing::{debug, info};

use crate::error::Result;
use crate::lease::{LeaseRecord, LeaseStore};

/// Environment variable carrying the lease expiry for `add` and `old`.
pub const LEASE_EXPIRES_ENV: &str = "DNSMASQ_LEASE_EXPIRES";

/// Fields reported with a lease event.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct LeaseEvent {
    pub mac_address: String,
    pub ip_address: Option<String>,
    pub client_hostname: Option<String>,
    pub client_id: Option<String>,
    #[arg(long, env = LEASE_EXPIRES_ENV, hide = true)]
    pub expires: Option<i64>,
}

impl From<LeaseEvent> for LeaseRecord {
    fn from(event: LeaseEvent) -> Self {
        LeaseRecord {
            expiry_time: event.expires,
            mac_address: event.mac_address,
            ip_address: event.ip_address,
            client_hostname: event.client_hostname,
            client_id: event.client_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum LeaseHookCommand {
    /// A new lease was granted.
    Add(LeaseEvent),
    /// A lease was released or expired.
    #[command(name = "del")]
    Delete(LeaseEvent),
    /// An existing lease was renewed or changed.
    #[command(name = "old")]
    Update(LeaseEvent),
    /// Dump all leases; the service reads this at startup.
    Init,
    /// Dump all leases.
    Show,
    /// A TFTP transfer finished. Nothing to record.
    Tftp {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
        args: Vec<String>,
    },
    /// Remove every lease.
    Clear,
}

/// Applies `command` to `store`, writing any lease dump to `out`.
pub async fn execute<W: Write>(
    command: LeaseHookCommand,
    store: &mut LeaseStore,
    out: &mut W,
) -> Result<()> {
    match command {
        LeaseHookCommand::Add(event) => {
            info!("lease add {}", event.mac_address);
            store.insert(event.into()).await
        }
        LeaseHookCommand::Update(event) => {
            info!("lease old {}", event.mac_address);
            store.update(event.into()).await
        }
        LeaseHookCommand::Delete(event) => {
            if !store.delete(&event.mac_address).await? {
                debug!("no lease for {} to delete", event.mac_address);
            }
            Ok(())
        }
        LeaseHookCommand::Init | LeaseHookCommand::Show => {
            for lease in store.list() {
                writeln!(out, "{}", lease)?;
            }
            Ok(())
        }
        LeaseHookCommand::Tftp { .. } => Ok(()),
        LeaseHookCommand::Clear => {
            let count = store.clear().await?;
            info!("cleared {} lease(s)", count);
            Ok(())
        }
    }
}
