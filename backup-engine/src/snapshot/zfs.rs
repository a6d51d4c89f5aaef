//! ZFS adapter: shells out to the system `zfs` tools.

use std::future::Future;
use std::pin::Pin;
use std::process::{ExitStatus, Output, Stdio};
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::{self, AsyncRead, ReadBuf};
use tokio::process::{ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{CreateOutcome, SendStream, SnapshotEngine, SnapshotError};

/// [`SnapshotEngine`] backed by the `zfs` command line.
#[derive(Debug, Default)]
pub struct ZfsEngine;

impl ZfsEngine {
    pub fn new() -> Self {
        Self
    }
}

fn snapshot_ref(dataset: &str, snapshot: &str) -> String {
    format!("{dataset}@{snapshot}")
}

async fn run_zfs(args: &[&str]) -> Result<Output, SnapshotError> {
    let command = format!("zfs {}", args.join(" "));
    debug!(%command, "running");
    let output = Command::new("zfs")
        .args(args)
        .output()
        .await
        .map_err(|source| SnapshotError::Spawn {
            command: command.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(SnapshotError::CommandFailed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

async fn snapshot_exists(dataset: &str, snapshot: &str) -> Result<bool, SnapshotError> {
    let target = snapshot_ref(dataset, snapshot);
    // A failing exit status here means "no such snapshot", not an error.
    let output = Command::new("zfs")
        .args(["list", "-t", "snapshot", &target])
        .output()
        .await
        .map_err(|source| SnapshotError::Spawn {
            command: format!("zfs list -t snapshot {target}"),
            source,
        })?;
    Ok(output.status.success())
}

/// Streams a child's stdout and surfaces a non-zero exit status as a read
/// error once the pipe drains, so a `zfs send` that dies mid-stream cannot
/// pass for a short but valid stream.
struct CommandStream {
    command: String,
    stdout: ChildStdout,
    wait: JoinHandle<io::Result<ExitStatus>>,
    reaped: bool,
}

impl AsyncRead for CommandStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.reaped {
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
            if buf.filled().len() > before {
                return Poll::Ready(Ok(()));
            }
            let status = ready!(Pin::new(&mut this.wait).poll(cx))
                .map_err(io::Error::other)??;
            this.reaped = true;
            if !status.success() {
                return Poll::Ready(Err(io::Error::other(format!(
                    "`{}` exited with {status}",
                    this.command
                ))));
            }
        }
        Poll::Ready(Ok(()))
    }
}

fn spawn_send(args: &[&str]) -> Result<SendStream, SnapshotError> {
    let command = format!("zfs {}", args.join(" "));
    debug!(%command, "spawning send");
    let mut child = Command::new("zfs")
        .args(args)
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|source| SnapshotError::Spawn {
            command: command.clone(),
            source,
        })?;
    let stdout = child.stdout.take().ok_or_else(|| SnapshotError::Spawn {
        command: command.clone(),
        source: io::Error::other("stdout was not captured"),
    })?;
    let wait = tokio::spawn(async move { child.wait().await });
    Ok(Box::pin(CommandStream {
        command,
        stdout,
        wait,
        reaped: false,
    }))
}

#[async_trait]
impl SnapshotEngine for ZfsEngine {
    async fn create(
        &self,
        dataset: &str,
        snapshot: &str,
    ) -> Result<CreateOutcome, SnapshotError> {
        let target = snapshot_ref(dataset, snapshot);
        match run_zfs(&["snapshot", &target]).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(err) => {
                // `zfs snapshot` fails when the name is taken; tell that
                // apart from every other failure before giving up.
                if snapshot_exists(dataset, snapshot).await? {
                    Ok(CreateOutcome::AlreadyExists)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn send_full(&self, dataset: &str, snapshot: &str) -> Result<SendStream, SnapshotError> {
        let target = snapshot_ref(dataset, snapshot);
        spawn_send(&["send", "-w", &target])
    }

    async fn send_incremental(
        &self,
        dataset: &str,
        from: &str,
        to: &str,
    ) -> Result<SendStream, SnapshotError> {
        let from_ref = snapshot_ref(dataset, from);
        let to_ref = snapshot_ref(dataset, to);
        spawn_send(&["send", "-w", "-i", &from_ref, &to_ref])
    }

    async fn receive(&self, dataset: &str, mut stream: SendStream) -> Result<(), SnapshotError> {
        let command = format!("zfs receive {dataset}");
        let mut child = Command::new("zfs")
            .args(["receive", dataset])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SnapshotError::Spawn {
                command: command.clone(),
                source,
            })?;
        let mut stdin = child.stdin.take().ok_or_else(|| SnapshotError::Spawn {
            command: command.clone(),
            source: io::Error::other("stdin was not captured"),
        })?;
        io::copy(&mut stream, &mut stdin).await?;
        drop(stdin);
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(SnapshotError::CommandFailed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
