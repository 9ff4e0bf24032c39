//! Local administrative control endpoint.
//!
//! A unix-domain stream socket accepting one newline-terminated command per
//! connection. The only command is `exit`, answered with an empty line.
//! Each connection is served on its own task and accepted requests are
//! forwarded over a channel, so a silent client cannot hold up an `exit`
//! and waiting on [`ControlServer::next_request`] can be cancelled without
//! losing a half-read command.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const EXIT_COMMAND: &str = "exit";
const REQUEST_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Exit,
}

impl ControlRequest {
    fn parse(command: &str) -> Option<Self> {
        match command {
            EXIT_COMMAND => Some(Self::Exit),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ControlServer {
    path: PathBuf,
    requests: mpsc::Receiver<ControlRequest>,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Binds the socket at `path`, replacing a stale socket file.
    ///
    /// Fails when another instance still accepts connections on `path`.
    /// Must be called from within a Tokio runtime.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(Error::Control(format!(
                    "{} is in use by a running instance",
                    path.display()
                )));
            }
            debug!("removing stale control socket {}", path.display());
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path).map_err(|error| {
            Error::Control(format!("could not bind {}: {}", path.display(), error))
        })?;
        info!("control endpoint listening on {}", path.display());

        let (sender, requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let task = tokio::spawn(serve(listener, sender));

        Ok(Self {
            path,
            requests,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the next accepted request. Returns `None` if the accept
    /// loop has stopped.
    pub async fn next_request(&mut self) -> Option<ControlRequest> {
        self.requests.recv().await
    }

    /// Stops accepting connections and removes the socket file.
    pub fn close(self) {
        self.task.abort();
        if let Err(error) = std::fs::remove_file(&self.path) {
            debug!("removing {} failed: {}", self.path.display(), error);
        }
    }
}

async fn serve(listener: UnixListener, sender: mpsc::Sender<ControlRequest>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_connection(stream, &sender).await {
                        warn!("control connection failed: {}", error);
                    }
                });
            }
            Err(error) => {
                warn!("control accept failed: {}", error);
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    sender: &mpsc::Sender<ControlRequest>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    let command = line.trim();

    match ControlRequest::parse(command) {
        Some(request) => {
            info!("control request: {}", command);
            writer.write_all(b"\n").await?;
            if sender.send(request).await.is_err() {
                debug!("control request dropped, loop already gone");
            }
        }
        None => {
            writer
                .write_all(format!("error: unknown command {}\n", command).as_bytes())
                .await?;
        }
    }
    writer.shutdown().await
}

/// Sends `command` to the endpoint at `path` and returns the reply line.
pub async fn send_command(path: &Path, command: &str) -> Result<String> {
    let stream = UnixStream::connect(path).await.map_err(|error| {
        Error::Control(format!("could not connect to {}: {}", path.display(), error))
    })?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(format!("{}\n", command).as_bytes()).await?;

    let mut reply = String::new();
    BufReader::new(reader).read_line(&mut reply).await?;
    Ok(reply.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_exit_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let mut server = ControlServer::bind(&path).unwrap();

        let reply = send_command(&path, "exit").await.unwrap();
        assert_eq!(reply, "");

        let request = tokio::time::timeout(Duration::from_secs(5), server.next_request())
            .await
            .unwrap();
        assert_eq!(request, Some(ControlRequest::Exit));

        server.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unknown_command_is_not_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let mut server = ControlServer::bind(&path).unwrap();

        let reply = send_command(&path, "reload").await.unwrap();
        assert_eq!(reply, "error: unknown command reload");

        let pending =
            tokio::time::timeout(Duration::from_millis(50), server.next_request()).await;
        assert!(pending.is_err());
        server.close();
    }

    #[tokio::test]
    async fn test_idle_client_does_not_block_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let mut server = ControlServer::bind(&path).unwrap();

        let _idle = UnixStream::connect(&path).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), send_command(&path, "exit"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, "");

        let request = tokio::time::timeout(Duration::from_secs(5), server.next_request())
            .await
            .unwrap();
        assert_eq!(request, Some(ControlRequest::Exit));
        server.close();
    }

    #[tokio::test]
    async fn test_bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let mut first = ControlServer::bind(&path).unwrap();

        let error = ControlServer::bind(&path).unwrap_err();
        assert!(matches!(error, Error::Control(_)));

        send_command(&path, "exit").await.unwrap();
        let request = tokio::time::timeout(Duration::from_secs(5), first.next_request())
            .await
            .unwrap();
        assert_eq!(request, Some(ControlRequest::Exit));
        first.close();
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        std::fs::write(&path, "").unwrap();
        let server = ControlServer::bind(&path).unwrap();
        server.close();

        let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(stale);
        let server = ControlServer::bind(&path).unwrap();
        server.close();
    }

    #[tokio::test]
    async fn test_connect_without_server() {
        let dir = tempfile::tempdir().unwrap();
        let error = send_command(&dir.path().join("missing.sock"), "exit")
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Control(_)));
    }
}
