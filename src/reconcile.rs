//! The daemon's main loop.
//!
//! Waits for the store to finish restoring its startup configuration,
//! starts the service from a full snapshot, then restarts it whenever the
//! store's change-sequence counter moves. Everything the loop mutates lives
//! in [`ReconciliationLoop`], so a test can drive it against a
//! [`MemoryStore`](crate::store::MemoryStore) without process-wide state.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::command::{CommandBuilder, CommandLine};
use crate::control::{ControlRequest, ControlServer};
use crate::error::Result;
use crate::lease::LeaseStore;
use crate::store::ConfigStore;
use crate::supervisor::ProcessSupervisor;
use crate::watcher::ConfigWatcher;

#[derive(Debug)]
enum Event {
    Control(ControlRequest),
    Poll(bool),
}

#[derive(Debug)]
pub struct ReconciliationLoop<S> {
    store: S,
    supervisor: ProcessSupervisor,
    builder: CommandBuilder,
    watcher: ConfigWatcher,
    leases: LeaseStore,
    control: Option<ControlServer>,
    startup_backoff: Duration,
    command: Option<CommandLine>,
    started: bool,
    exiting: bool,
}

impl<S: ConfigStore> ReconciliationLoop<S> {
    pub fn new(
        store: S,
        supervisor: ProcessSupervisor,
        builder: CommandBuilder,
        watcher: ConfigWatcher,
        leases: LeaseStore,
        startup_backoff: Duration,
    ) -> Self {
        Self {
            store,
            supervisor,
            builder,
            watcher,
            leases,
            control: None,
            startup_backoff,
            command: None,
            started: false,
            exiting: false,
        }
    }

    pub fn with_control(mut self, control: ControlServer) -> Self {
        self.control = Some(control);
        self
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn leases(&self) -> &LeaseStore {
        &self.leases
    }

    /// The command line the service was last started with.
    pub fn command(&self) -> Option<&CommandLine> {
        self.command.as_ref()
    }

    pub fn watermark(&self) -> u64 {
        self.watcher.watermark()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    /// Runs until an `exit` control request arrives, then shuts down.
    ///
    /// Only a store failure while waiting for the startup configuration is
    /// returned; later store errors are retried by the watcher.
    pub async fn run(mut self) -> Result<()> {
        let result = self.wait_for_configuration().await;
        if result.is_ok() {
            while !self.exiting {
                self.step().await;
            }
        }
        self.shutdown().await;
        result
    }

    /// Blocks until the store is configured and the service has been
    /// started once, or until an exit request arrives.
    pub async fn wait_for_configuration(&mut self) -> Result<()> {
        while !self.exiting {
            self.store.run().await?;
            if self.store.is_configured() {
                self.initial_reconcile().await;
                return Ok(());
            }

            debug!("system configuration not restored yet");
            tokio::select! {
                request = next_control(&mut self.control) => self.handle_control(request),
                _ = tokio::time::sleep(self.startup_backoff) => {}
            }
        }
        Ok(())
    }

    /// One steady-state iteration: wait for a control request or a store
    /// change, then act on it.
    pub async fn step(&mut self) {
        let event = tokio::select! {
            request = next_control(&mut self.control) => Event::Control(request),
            changed = self.watcher.poll(&mut self.store) => Event::Poll(changed),
        };

        match event {
            Event::Control(request) => self.handle_control(request),
            Event::Poll(true) => self.reconcile().await,
            Event::Poll(false) => {}
        }
    }

    /// Stops the service, the control endpoint and the store.
    pub async fn shutdown(&mut self) {
        info!("shutting down");
        self.supervisor.shutdown().await;
        if let Some(control) = self.control.take() {
            control.close();
        }
        self.store.close();
    }

    fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Exit => {
                info!("exit requested");
                self.exiting = true;
            }
        }
    }

    async fn initial_reconcile(&mut self) {
        let seqno = self.store.change_seqno();
        let snapshot = self.store.snapshot();

        if !snapshot.has_ranges() && !self.started {
            match self.leases.clear().await {
                Ok(0) => {}
                Ok(count) => info!("cleared {} stale lease(s)", count),
                Err(clear_error) => warn!("clearing stale leases failed: {}", clear_error),
            }
        }

        let command = self.builder.build(&snapshot);
        if !self.supervisor.is_running()
            && let Err(start_error) = self.supervisor.start(&command).await
        {
            error!("service failed to start: {}", start_error);
        }

        self.started = true;
        self.command = Some(command);
        self.watcher.mark(seqno);
    }

    async fn reconcile(&mut self) {
        let seqno = self.store.change_seqno();
        let command = self.builder.build(&self.store.snapshot());

        if self.supervisor.is_running() && self.command.as_ref() == Some(&command) {
            debug!("service arguments unchanged, not restarting");
        } else if let Err(restart_error) = self.supervisor.restart(&command).await {
            error!("service failed to restart: {}", restart_error);
        }

        self.command = Some(command);
        self.watcher.mark(seqno);
    }
}

async fn next_control(control: &mut Option<ControlServer>) -> ControlRequest {
    if let Some(control) = control
        && let Some(request) = control.next_request().await
    {
        return request;
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseRecord;
    use crate::model::AddressPool;
    use crate::store::{MemoryStore, MemoryStoreHandle, StoreDocument};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const PROCESS_NAME: &str = "no-such-service";

    struct Fixture {
        dir: TempDir,
        service: PathBuf,
        invocations: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_preamble("")
        }

        /// A service that reports a configuration error on stderr and exits
        /// until `ready` exists in the fixture directory.
        fn failing_until_ready() -> Self {
            Self::with_preamble(
                "[ -e \"$(dirname \"$0\")/ready\" ] || { echo 'bad config' >&2; exit 1; }\n",
            )
        }

        fn with_preamble(preamble: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let service = dir.path().join("fake-service");
            let invocations = dir.path().join("invocations");
            let script = format!(
                "#!/bin/sh\n{}echo \"$*\" >> {}\nexec sleep 30\n",
                preamble,
                invocations.display()
            );
            std::fs::write(&service, script).unwrap();
            std::fs::set_permissions(&service, std::fs::Permissions::from_mode(0o755)).unwrap();
            Self {
                dir,
                service,
                invocations,
            }
        }

        fn starts(&self) -> usize {
            std::fs::read_to_string(&self.invocations)
                .map(|content| content.lines().count())
                .unwrap_or(0)
        }

        async fn leases(&self) -> LeaseStore {
            LeaseStore::open(self.dir.path().join("leases.json"))
                .await
                .unwrap()
        }

        async fn build(&self, store: MemoryStore) -> ReconciliationLoop<MemoryStore> {
            let leases = self.leases().await;
            self.build_with(store, leases)
        }

        fn build_with(
            &self,
            store: MemoryStore,
            leases: LeaseStore,
        ) -> ReconciliationLoop<MemoryStore> {
            let supervisor = ProcessSupervisor::new(
                PROCESS_NAME,
                Duration::from_millis(100),
                Duration::from_secs(1),
            );
            let builder = CommandBuilder::new(&self.service, "nobody", Path::new("/bin/true"));
            ReconciliationLoop::new(
                store,
                supervisor,
                builder,
                ConfigWatcher::new(Duration::from_millis(50)),
                leases,
                Duration::from_millis(10),
            )
        }
    }

    fn range(name: &str, start: &str) -> AddressPool {
        AddressPool {
            name: name.to_string(),
            start_ip_address: start.to_string(),
            ..Default::default()
        }
    }

    fn configured_store() -> (MemoryStore, MemoryStoreHandle) {
        let (store, handle) = MemoryStore::new(StoreDocument::default());
        handle
            .commit(|document| {
                document.cur_cfg = 1;
                document.config.ranges.push(range("r1", "10.0.0.1"));
            })
            .unwrap();
        (store, handle)
    }

    #[tokio::test]
    async fn test_no_restart_without_seqno_change() {
        let fixture = Fixture::new();
        let (store, _handle) = configured_store();
        let mut reconciler = fixture.build(store).await;

        reconciler.wait_for_configuration().await.unwrap();
        assert!(reconciler.is_started());
        assert!(reconciler.supervisor().is_running());
        assert_eq!(reconciler.watermark(), 1);
        let pid = reconciler.supervisor().pid();

        reconciler.step().await;
        reconciler.step().await;
        assert_eq!(reconciler.supervisor().pid(), pid);
        assert_eq!(fixture.starts(), 1);

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_on_change() {
        let fixture = Fixture::new();
        let (store, handle) = configured_store();
        let mut reconciler = fixture.build(store).await;
        reconciler.wait_for_configuration().await.unwrap();
        let pid = reconciler.supervisor().pid();

        handle
            .commit(|document| document.config.ranges.push(range("r2", "10.1.0.1")))
            .unwrap();
        reconciler.step().await;

        assert_eq!(reconciler.watermark(), 2);
        assert_eq!(fixture.starts(), 2);
        assert_ne!(reconciler.supervisor().pid(), pid);
        assert!(
            reconciler
                .command()
                .unwrap()
                .args
                .contains(&"--dhcp-range=10.1.0.1".to_string())
        );

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_retried_on_next_change() {
        let fixture = Fixture::failing_until_ready();
        let (store, handle) = configured_store();
        let mut reconciler = fixture.build(store).await;

        reconciler.wait_for_configuration().await.unwrap();
        assert!(reconciler.is_started());
        assert!(!reconciler.supervisor().is_running());
        assert_eq!(fixture.starts(), 0);

        std::fs::write(fixture.dir.path().join("ready"), "").unwrap();
        handle
            .commit(|document| document.config.ranges.push(range("r2", "10.1.0.1")))
            .unwrap();
        reconciler.step().await;

        assert!(reconciler.supervisor().is_running());
        assert_eq!(fixture.starts(), 1);
        assert_eq!(reconciler.watermark(), 2);

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_retried_even_with_same_arguments() {
        let fixture = Fixture::failing_until_ready();
        let (store, handle) = configured_store();
        let mut reconciler = fixture.build(store).await;
        reconciler.wait_for_configuration().await.unwrap();
        assert!(!reconciler.supervisor().is_running());

        std::fs::write(fixture.dir.path().join("ready"), "").unwrap();
        handle.commit(|document| document.cur_cfg = 2).unwrap();
        reconciler.step().await;

        assert!(reconciler.supervisor().is_running());
        assert_eq!(fixture.starts(), 1);

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unchanged_arguments_skip_restart() {
        let fixture = Fixture::new();
        let (store, handle) = configured_store();
        let mut reconciler = fixture.build(store).await;
        reconciler.wait_for_configuration().await.unwrap();

        handle.commit(|document| document.cur_cfg = 2).unwrap();
        reconciler.step().await;

        assert_eq!(reconciler.watermark(), 2);
        assert_eq!(fixture.starts(), 1);

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_waits_for_configuration() {
        let fixture = Fixture::new();
        let (store, handle) = MemoryStore::new(StoreDocument::default());
        let mut reconciler = fixture.build(store).await;

        let writer = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .commit(|document| {
                    document.cur_cfg = 1;
                    document.config.ranges.push(range("r1", "10.0.0.1"));
                })
                .unwrap();
        });

        tokio::time::timeout(Duration::from_secs(5), reconciler.wait_for_configuration())
            .await
            .unwrap()
            .unwrap();
        assert!(reconciler.is_started());
        assert_eq!(fixture.starts(), 1);

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_leases_cleared_without_ranges() {
        let fixture = Fixture::new();
        let mut leases = fixture.leases().await;
        leases
            .insert(LeaseRecord::new("11:22:33:44:55:66"))
            .await
            .unwrap();

        let (store, handle) = MemoryStore::new(StoreDocument::default());
        handle.commit(|document| document.cur_cfg = 1).unwrap();
        let mut reconciler = fixture.build_with(store, leases);
        reconciler.wait_for_configuration().await.unwrap();

        assert!(reconciler.leases().is_empty());
        assert!(fixture.leases().await.is_empty());

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_leases_kept_with_ranges() {
        let fixture = Fixture::new();
        let mut leases = fixture.leases().await;
        leases
            .insert(LeaseRecord::new("11:22:33:44:55:66"))
            .await
            .unwrap();

        let (store, _handle) = configured_store();
        let mut reconciler = fixture.build_with(store, leases);
        reconciler.wait_for_configuration().await.unwrap();

        assert_eq!(reconciler.leases().len(), 1);

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_exit_request_ends_run() {
        let fixture = Fixture::new();
        let socket = fixture.dir.path().join("ctl.sock");
        let (store, _handle) = configured_store();
        let control = ControlServer::bind(&socket).unwrap();
        let reconciler = fixture.build(store).await.with_control(control);

        let running = tokio::spawn(reconciler.run());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let reply = crate::control::send_command(&socket, "exit").await.unwrap();
        assert_eq!(reply, "");

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!socket.exists());
        assert_eq!(fixture.starts(), 1);
    }

    #[tokio::test]
    async fn test_exit_while_waiting_for_configuration() {
        let fixture = Fixture::new();
        let socket = fixture.dir.path().join("ctl.sock");
        let (store, _handle) = MemoryStore::new(StoreDocument::default());
        let control = ControlServer::bind(&socket).unwrap();
        let reconciler = fixture.build(store).await.with_control(control);

        let running = tokio::spawn(reconciler.run());
        crate::control::send_command(&socket, "exit").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(fixture.starts(), 0);
    }
}
