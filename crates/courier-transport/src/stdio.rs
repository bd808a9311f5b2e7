//! Subprocess pipe transport: newline-delimited messages over the
//! stdin/stdout of a spawned server process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_core::TransportError;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{Transport, TransportResult};

/// Configuration for spawning a stdio server process.
#[derive(Debug, Clone, Deserialize)]
pub struct StdioServerConfig {
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl StdioServerConfig {
    /// Config for a bare command with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// Transport over a child process's standard input/output.
///
/// Frames are single lines of UTF-8; the child's stderr is discarded.
/// The child is killed when the transport is dropped, so an aborted
/// session cannot leak server processes.
pub struct StdioTransport {
    child: Mutex<Child>,
    // Option so close() can drop the pipe, signalling EOF to the child.
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Lines<BufReader<ChildStdout>>>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawns the configured server process and wires up its pipes.
    pub fn spawn(config: &StdioServerConfig) -> TransportResult<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        for (key, val) in &config.env {
            cmd.env(key, val);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {e}", config.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("child stdout not captured".into()))?;

        debug!(command = %config.command, "spawned stdio server");

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout).lines()),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };
        stdin.write_all(&frame).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Option<Vec<u8>>> {
        let mut lines = self.stdout.lock().await;
        loop {
            match lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(line.into_bytes())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Drop stdin first so a well-behaved server sees EOF and exits
        // on its own; then make sure the process is gone.
        self.stdin.lock().await.take();
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
        debug!("stdio transport closed");
        Ok(())
    }
}
