//! Lifecycle of the external DHCP/TFTP service process.
//!
//! # States
//!
//! ```text
//! Stopped --start--> Starting --ok--> Running --restart--> Restarting --start--> ...
//!                        |                                     ^
//!                        +--stderr output / spawn failure--> Stopped
//! ```
//!
//! A failed start is not retried here; the reconciliation loop tries again
//! on the next configuration change, so `restart` is also accepted from
//! `Stopped`.
//!
//! The service may fork helpers that outlive the tracked child (the usual
//! daemonizing double fork), so a restart also sweeps the process table for
//! processes with the service's name and kills them by pid.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::command::CommandLine;
use crate::config::Config;
use crate::error::{Error, Result};

/// Linux keeps 15 characters of a process name in `/proc/<pid>/comm`.
const COMM_NAME_LENGTH: usize = 15;
const STDERR_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    state: SupervisorState,
    child: Option<Child>,
    process_name: String,
    startup_timeout: Duration,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(
        process_name: impl Into<String>,
        startup_timeout: Duration,
        stop_grace: Duration,
    ) -> Self {
        Self {
            state: SupervisorState::Stopped,
            child: None,
            process_name: process_name.into(),
            startup_timeout,
            stop_grace,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let process_name = config.process_name().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "cannot derive a process name from {}",
                config.service_binary.display()
            ))
        })?;
        Ok(Self::new(
            process_name,
            config.startup_timeout(),
            config.stop_grace(),
        ))
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SupervisorState::Running
    }

    /// Pid of the tracked child, if one is held.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Spawns the service and confirms it started.
    ///
    /// Anything the service writes to stderr within the startup window is
    /// a configuration error: it is logged, the child is killed and the
    /// supervisor returns to `Stopped`.
    pub async fn start(&mut self, command: &CommandLine) -> Result<()> {
        self.state = SupervisorState::Starting;
        info!("starting service: {}", command);

        let mut child = match Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(spawn_error) => {
                self.state = SupervisorState::Stopped;
                error!("failed to spawn {}: {}", command.program.display(), spawn_error);
                return Err(Error::ProcessSpawn(format!(
                    "{}: {}",
                    command.program.display(),
                    spawn_error
                )));
            }
        };

        let deadline = Instant::now() + self.startup_timeout;
        let startup = match child.stderr.take() {
            Some(stderr) => read_startup_errors(stderr, deadline).await,
            None => StartupOutput::default(),
        };

        let failure = if !startup.output.trim().is_empty() {
            Some(startup.output.trim().to_string())
        } else if startup.remaining.is_none() {
            // stderr closed inside the window: a daemonizing parent is
            // about to exit, so its status tells whether startup worked.
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) if !status.success() => {
                    Some(format!("exited during startup with {}", status))
                }
                _ => None,
            }
        } else {
            None
        };

        if let Some(message) = failure {
            error!("{}", message);
            error!("Error with config, service failed, command {}", command);
            if let Err(kill_error) = child.kill().await {
                debug!("failed service already gone: {}", kill_error);
            }
            self.state = SupervisorState::Stopped;
            return Err(Error::ProcessSpawn(message));
        }

        if let Some(stderr) = startup.remaining {
            tokio::spawn(forward_stderr(stderr));
        }

        info!("service started (pid {:?})", child.id());
        self.child = Some(child);
        self.state = SupervisorState::Running;
        Ok(())
    }

    /// Stops the tracked process, kills any same-named strays, then starts
    /// the service with `command`.
    pub async fn restart(&mut self, command: &CommandLine) -> Result<()> {
        self.state = SupervisorState::Restarting;
        self.stop_tracked().await;
        self.kill_strays();
        self.start(command).await
    }

    /// Stops the tracked process and leaves the supervisor `Stopped`.
    pub async fn shutdown(&mut self) {
        self.stop_tracked().await;
        self.state = SupervisorState::Stopped;
    }

    async fn stop_tracked(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("tracked service already exited with {}", status);
            return;
        }

        if let Some(pid) = child.id() {
            debug!("terminating service pid {}", pid);
            if let Err(errno) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                && errno != Errno::ESRCH
            {
                warn!(pid, error = ?errno, "SIGTERM to service failed");
            }
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => debug!("service exited with {}", status),
            Ok(Err(wait_error)) => warn!("waiting for service failed: {}", wait_error),
            Err(_) => {
                warn!("service ignored SIGTERM, killing");
                if let Err(kill_error) = child.kill().await {
                    debug!("kill after grace period failed: {}", kill_error);
                }
            }
        }
    }

    fn kill_strays(&self) {
        let own_pid = std::process::id();
        for pid in find_processes_by_name(Path::new("/proc"), &self.process_name) {
            if pid == own_pid {
                continue;
            }
            kill_stray(pid);
        }
    }
}

#[derive(Debug, Default)]
struct StartupOutput {
    output: String,
    /// Still-open stderr when the window closed before end of stream.
    remaining: Option<ChildStderr>,
}

async fn read_startup_errors(mut stderr: ChildStderr, deadline: Instant) -> StartupOutput {
    let mut collected = Vec::new();
    let mut buffer = [0u8; STDERR_CHUNK_SIZE];

    let remaining = loop {
        match tokio::time::timeout_at(deadline, stderr.read(&mut buffer)).await {
            Ok(Ok(0)) => break None,
            Ok(Ok(count)) => collected.extend_from_slice(&buffer[..count]),
            Ok(Err(read_error)) => {
                warn!("reading service stderr failed: {}", read_error);
                break None;
            }
            Err(_) => break Some(stderr),
        }
    };

    StartupOutput {
        output: String::from_utf8_lossy(&collected).into_owned(),
        remaining,
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("service: {}", line);
    }
}

/// Sends SIGKILL to `pid`. Returns false when the process was already gone.
pub fn kill_stray(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => {
            info!("killed stray service process {}", pid);
            true
        }
        Err(Errno::ESRCH) => {
            info!("unable to kill previous process {}", pid);
            false
        }
        Err(errno) => {
            warn!(pid, error = ?errno, "SIGKILL to stray service process failed");
            false
        }
    }
}

/// Lists pids under `proc_root` whose command name equals `name`.
///
/// Entries that vanish or cannot be read while scanning are skipped.
pub fn find_processes_by_name(proc_root: &Path, name: &str) -> Vec<u32> {
    let wanted: String = name.chars().take(COMM_NAME_LENGTH).collect();
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut pids: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            let comm = std::fs::read_to_string(entry.path().join("comm")).ok()?;
            (comm.trim_end() == wanted).then_some(pid)
        })
        .collect();
    pids.sort_unstable();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(
            "no-such-service",
            Duration::from_millis(300),
            Duration::from_millis(500),
        )
    }

    fn shell(script: &str) -> CommandLine {
        CommandLine {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[tokio::test]
    async fn test_start_success() {
        let mut supervisor = supervisor();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);

        supervisor.start(&shell("exit 0")).await.unwrap();
        assert!(supervisor.is_running());

        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_stderr_output_fails_start() {
        let mut supervisor = supervisor();
        let error = supervisor
            .start(&shell("echo 'bad dhcp-range' >&2"))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::ProcessSpawn(ref message) if message == "bad dhcp-range"));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_failed_exit_status_fails_start() {
        let mut supervisor = supervisor();
        let error = supervisor.start(&shell("exit 3")).await.unwrap_err();
        assert!(error.to_string().contains("exited during startup"));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut supervisor = supervisor();
        let command = CommandLine {
            program: PathBuf::from("/nonexistent/dnsmasq"),
            args: vec![],
        };
        let error = supervisor.start(&command).await.unwrap_err();
        assert!(matches!(error, Error::ProcessSpawn(_)));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_replaces_long_running_process() {
        let mut supervisor = supervisor();
        let command = CommandLine {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
        };

        supervisor.start(&command).await.unwrap();
        let first = supervisor.pid().unwrap();

        supervisor.restart(&command).await.unwrap();
        let second = supervisor.pid().unwrap();
        assert_ne!(first, second);
        assert!(supervisor.is_running());

        supervisor.shutdown().await;
        assert!(supervisor.pid().is_none());
    }

    #[tokio::test]
    async fn test_restart_from_stopped_starts() {
        let mut supervisor = supervisor();
        supervisor.restart(&shell("exit 0")).await.unwrap();
        assert!(supervisor.is_running());
    }

    #[test]
    fn test_find_processes_in_fake_proc() {
        let dir = tempfile::tempdir().unwrap();
        for (pid, comm) in [("101", "dnsmasq\n"), ("102", "sshd\n"), ("103", "dnsmasq\n")] {
            let entry = dir.path().join(pid);
            std::fs::create_dir(&entry).unwrap();
            std::fs::write(entry.join("comm"), comm).unwrap();
        }
        std::fs::create_dir(dir.path().join("self")).unwrap();
        std::fs::create_dir(dir.path().join("104")).unwrap();

        assert_eq!(find_processes_by_name(dir.path(), "dnsmasq"), vec![101, 103]);
        assert!(find_processes_by_name(dir.path(), "dhcpd").is_empty());
    }

    #[test]
    fn test_long_names_match_truncated_comm() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("200");
        std::fs::create_dir(&entry).unwrap();
        std::fs::write(entry.join("comm"), "dnsmasq-wrapper\n").unwrap();

        assert_eq!(
            find_processes_by_name(dir.path(), "dnsmasq-wrapper-v2"),
            vec![200]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_kill_stray_tolerates_missing_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(find_processes_by_name(Path::new("/proc"), "sleep").contains(&pid));

        assert!(kill_stray(pid));
        child.wait().unwrap();
        assert!(!kill_stray(pid));
    }
}
