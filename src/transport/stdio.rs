use std::{collections::HashMap, io::ErrorKind, process::Stdio};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{
    InboundChannel, JsonRpcMessage, Lifecycle, Transport, TransportKind, TransportState,
};
use crate::error::TransportError;

// Substring the diagnostic stream carries when the command could not be found.
pub(crate) const EXECUTABLE_MISSING_MARKER: &str = "MODULE_NOT_FOUND";

pub(crate) struct StdioClientTransport {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    lifecycle: Lifecycle,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<ChildStdin>>,
    inbound: InboundChannel<JsonRpcMessage>,
    diagnostics: InboundChannel<String>,
}

impl StdioClientTransport {
    pub(crate) fn new(program: String, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            program,
            args,
            env,
            lifecycle: Lifecycle::new(),
            child: Mutex::new(None),
            writer: Mutex::new(None),
            inbound: InboundChannel::new(),
            diagnostics: InboundChannel::new(),
        }
    }

    fn spawn_stderr_loop(&self, mut stderr: ChildStderr) -> JoinHandle<()> {
        let tx = self.diagnostics.sender();
        let program = self.program.clone();
        tokio::spawn(async move {
            let Some(tx) = tx else {
                return;
            };
            let mut buffer = vec![0_u8; 4096];
            loop {
                match stderr.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(read) => {
                        let chunk = String::from_utf8_lossy(&buffer[..read]).to_string();
                        if tx.send(chunk).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%program, %error, "process stderr read error");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_stdout_loop(&self, stdout: ChildStdout, stderr_task: JoinHandle<()>) {
        let tx = self.inbound.sender();
        let closed = self.lifecycle.close_signal();
        let program = self.program.clone();
        tokio::spawn(async move {
            let Some(tx) = tx else {
                return;
            };
            let mut lines = BufReader::new(stdout).lines();

            loop {
                let line = tokio::select! {
                    _ = closed.cancelled() => return,
                    line = lines.next_line() => line,
                };

                match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }

                        match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                            Ok(message) => {
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                tracing::warn!(%program, %error, line = %trimmed, "invalid json on process stdout");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(%program, %error, "process stdout read error");
                        break;
                    }
                }
            }

            // stderr is flushed before the exit is reported so diagnostics
            // written just before exiting are not lost.
            let _ = stderr_task.await;
            tracing::info!(%program, "process output closed");
            drop(tx);
            closed.cancel();
        });
    }

    fn report_missing_executable(&self, error: &std::io::Error) {
        tracing::warn!(program = %self.program, %error, "executable not found");
        self.diagnostics.push(format!(
            "Error: Cannot find executable '{}' ({EXECUTABLE_MISSING_MARKER}): {error}",
            self.program
        ));
        self.diagnostics.shut();
    }
}

#[async_trait]
impl Transport for StdioClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.lifecycle.mark_started()?;

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                // Reported through the diagnostic stream; the inbound side
                // stays open until the session is torn down.
                self.report_missing_executable(&error);
                return Ok(());
            }
            Err(error) => {
                self.close().await;
                return Err(TransportError::Io(error));
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.kill().await;
            self.close().await;
            return Err(TransportError::Handshake(
                "process stdio unavailable".to_string(),
            ));
        };

        tracing::info!(program = %self.program, pid = ?child.id(), "process started");

        *self.writer.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        let stderr_task = self.spawn_stderr_loop(stderr);
        self.spawn_stdout_loop(stdout, stderr_task);
        self.inbound.shut();
        self.diagnostics.shut();

        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.lifecycle.ensure_started()?;
        if self.lifecycle.is_closed() {
            return Ok(());
        }

        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        let closed = self.lifecycle.close_signal();
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            if self.lifecycle.is_closed() {
                return Ok(());
            }
            return Err(TransportError::Io(std::io::Error::new(
                ErrorKind::NotConnected,
                format!("process '{}' is not running", self.program),
            )));
        };

        // A child that stops reading stdin must not block close().
        tokio::select! {
            _ = closed.cancelled() => Ok(()),
            written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            } => written.map_err(TransportError::Io),
        }
    }

    async fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }

        self.inbound.shut();
        self.diagnostics.shut();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match child.kill().await {
                Ok(()) => tracing::debug!(program = %self.program, "process killed"),
                Err(error) => {
                    tracing::debug!(program = %self.program, %error, "process already exited")
                }
            }
        }
        self.writer.lock().await.take();
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.inbound.take_receiver()
    }

    fn close_signal(&self) -> CancellationToken {
        self.lifecycle.close_signal()
    }

    fn take_diagnostics(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.diagnostics.take_receiver()
    }
}
