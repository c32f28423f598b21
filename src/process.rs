//! Process-Backed Worker Engine
//!
//! Runs each worker unit as an independent child process of the downloaded
//! transcoding executable and speaks the worker protocol as JSON lines over
//! the child's stdin/stdout. The executable itself is a black box; only the
//! line protocol is assumed.
//!
//! On Windows, spawning console binaries from a GUI host can pop a console
//! window per worker. The creation flags below suppress that.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::engine::{WorkerChannels, WorkerEngine};
use crate::error::{PoolError, PoolResult};
use crate::protocol::{RunCommand, WorkerMessage};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Apply platform-specific flags to a worker process command.
fn configure_command(cmd: &mut Command) {
    #[cfg(target_os = "windows")]
    {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    let _ = cmd;
}

/// Engine that materializes the payload as an executable file in `work_dir`
/// and spawns one child process per worker unit.
pub struct ProcessEngine {
    work_dir: PathBuf,
}

impl ProcessEngine {
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }

    /// Write the payload to disk once; later spawns reuse the same file.
    async fn materialize(&self, payload: &[u8]) -> PoolResult<PathBuf> {
        let path = self.work_dir.join("worker.bin");

        let already_present = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len() as usize == payload.len(),
            Err(_) => false,
        };
        if !already_present {
            tokio::fs::create_dir_all(&self.work_dir).await?;
            tokio::fs::write(&path, payload).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                    .await?;
            }
        }

        Ok(path)
    }
}

#[async_trait]
impl WorkerEngine for ProcessEngine {
    async fn spawn_worker(&self, payload: &[u8]) -> PoolResult<WorkerChannels> {
        let executable = self.materialize(payload).await?;

        let mut cmd = Command::new(&executable);
        configure_command(&mut cmd);
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PoolError::SpawnFailed(err.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::SpawnFailed("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::SpawnFailed("worker stdout unavailable".to_string()))?;

        let (command_tx, mut command_rx) = mpsc::channel::<RunCommand>(1);
        let (message_tx, message_rx) = mpsc::channel::<WorkerMessage>(32);

        // Writer: one JSON line per command. Ends when the pool drops its
        // sender; the child dies with it (kill_on_drop).
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(command) = command_rx.recv().await {
                let line = match serde_json::to_string(&command) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::error!("Failed to encode worker command: {err}");
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    tracing::warn!("Worker stdin closed; stopping command writer");
                    break;
                }
            }
            let _ = child.kill().await;
        });

        // Reader: one JSON line per lifecycle message. Stdout closing drops
        // the message sender, which the pool treats as a crash unless the
        // worker already signaled `exit`.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<WorkerMessage>(line) {
                            Ok(msg) => {
                                if message_tx.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                tracing::warn!("Unparseable worker message: {err}: {line}");
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        tracing::warn!("Worker stdout read failed: {err}");
                        return;
                    }
                }
            }
        });

        Ok(WorkerChannels {
            commands: command_tx,
            messages: message_rx,
        })
    }
}
