//! # dhcp-tftpd
//!
//! A supervisor that keeps an external DHCP/TFTP service (dnsmasq) in step
//! with a configuration store.
//!
//! ## Features
//!
//! - Address and field validation applied before a configuration write commits
//! - Deterministic translation of the configuration into the service's command line
//! - Restart of the service whenever the store's change counter moves
//! - Sweep of stray service processes left behind by forked helpers
//! - A lease hook executable that records the service's lease events
//! - Local control socket for graceful shutdown
//! - Async/await with Tokio on a single-threaded runtime
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use dhcp_tftpd::{
//!     CommandBuilder, Config, ConfigWatcher, FileStore, LeaseStore, ProcessSupervisor,
//!     ReconciliationLoop,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> dhcp_tftpd::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let store = FileStore::open(&config.store_path, config.store_settle())?;
//!     let leases = LeaseStore::open(&config.leases_file).await?;
//!     let reconciler = ReconciliationLoop::new(
//!         store,
//!         ProcessSupervisor::from_config(&config)?,
//!         CommandBuilder::from_config(&config),
//!         ConfigWatcher::new(config.poll_timeout()),
//!         leases,
//!         Duration::from_secs(2),
//!     );
//!     reconciler.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`address`] / [`validate`] - Address predicates and per-record write validation
//! - [`CommandBuilder`] - Snapshot to service argument vector
//! - [`ConfigStore`] - Source of snapshots and the change-sequence counter
//! - [`ConfigWatcher`] - Bounded wait for a counter change
//! - [`ProcessSupervisor`] - Start, restart and stop of the service process
//! - [`ReconciliationLoop`] - The daemon's main loop
//! - [`LeaseStore`] / [`hook`] - Lease records written by the lease hook

pub mod address;
pub mod command;
pub mod config;
pub mod control;
pub mod error;
pub mod hook;
pub mod lease;
pub mod model;
pub mod reconcile;
pub mod store;
pub mod supervisor;
pub mod validate;
pub mod watcher;

pub use address::AddressFamily;
pub use command::{CommandBuilder, CommandLine};
pub use config::Config;
pub use control::{ControlRequest, ControlServer};
pub use error::{Error, Result};
pub use hook::{LeaseEvent, LeaseHookCommand};
pub use lease::{LeaseRecord, LeaseStore};
pub use model::{
    AddressPool, BootBinding, ConfigSnapshot, MatchBinding, OptionBinding, OptionKey,
    ServiceSettings, StaticHost,
};
pub use reconcile::ReconciliationLoop;
pub use store::{ConfigStore, FileStore, MemoryStore, MemoryStoreHandle, StoreDocument};
pub use supervisor::{ProcessSupervisor, SupervisorState};
pub use watcher::ConfigWatcher;
