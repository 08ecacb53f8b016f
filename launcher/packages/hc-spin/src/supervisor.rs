//! Process Supervisor - spawns the external binaries, streams their output into
//! readiness trackers and tears everything down on shutdown.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use hc_spin_error::SpinError;

use crate::lines::{LineScanner, StreamKind};
use crate::readiness::ReadinessTracker;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for buffered output after a child has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// One process to launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Name used in logs and errors, e.g. `hc sandbox`
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    /// Written to stdin, which is then closed
    pub stdin_payload: Option<String>,
}

impl SpawnSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args,
            stdin_payload: None,
        }
    }

    pub fn with_stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin_payload = Some(payload.into());
        self
    }
}

/// Exit report of a supervised child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildExit {
    pub process: String,
    pub index: usize,
    pub exit_code: Option<i32>,
    pub status: String,
}

impl ChildExit {
    pub fn into_error(self) -> SpinError {
        SpinError::ProcessExited {
            process: self.process,
            status: self.status,
            exit_code: self.exit_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Line {
        process: String,
        stream: StreamKind,
        line: String,
    },
    StreamFailed {
        process: String,
        message: String,
    },
    Exited(ChildExit),
}

/// Snapshot of a tracked child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildInfo {
    pub index: usize,
    pub label: String,
    pub program: String,
    pub pid: Option<u32>,
    pub alive: bool,
}

struct ManagedChild {
    info: ChildInfo,
    child: Arc<Mutex<Option<Child>>>,
    alive: Arc<AtomicBool>,
}

/// External command run once after the children have been signalled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Output of a group of processes spawned together.
///
/// Every reader and monitor task of the group feeds one channel, so a
/// tracker driven from [`Batch::await_ready`] sees one line at a time.
pub struct Batch {
    labels: Vec<String>,
    events: mpsc::UnboundedReceiver<SupervisorEvent>,
}

impl Batch {
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Feeds stdout lines into `tracker` until it reports ready.
    ///
    /// Fails when any process of the batch exits first, when a marker is
    /// malformed, or when `timeout` elapses.
    pub async fn await_ready<T: ReadinessTracker>(
        &mut self,
        tracker: &mut T,
        timeout: Duration,
    ) -> Result<T::Ready, SpinError> {
        let result = tokio::time::timeout(timeout, drive(&mut self.events, tracker)).await;
        match result {
            Ok(result) => result,
            Err(_) => Err(SpinError::Timeout {
                what: tracker.awaiting(),
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Next raw event from the batch.
    pub async fn next_event(&mut self) -> Option<SupervisorEvent> {
        self.events.recv().await
    }
}

async fn drive<T: ReadinessTracker>(
    events: &mut mpsc::UnboundedReceiver<SupervisorEvent>,
    tracker: &mut T,
) -> Result<T::Ready, SpinError> {
    while let Some(event) = events.recv().await {
        match event {
            SupervisorEvent::Line {
                process,
                stream: StreamKind::Stdout,
                line,
            } => {
                if let Some(ready) = tracker.ingest(&process, &line)? {
                    return Ok(ready);
                }
            }
            SupervisorEvent::Line { .. } => {}
            SupervisorEvent::StreamFailed { process, message } => {
                return Err(SpinError::StreamError {
                    message: format!("{process}: {message}"),
                });
            }
            SupervisorEvent::Exited(exit) => return Err(exit.into_error()),
        }
    }
    Err(SpinError::StreamError {
        message: "process output closed before it reported ready".to_string(),
    })
}

/// Owns every child process of a launch session.
pub struct Supervisor {
    children: Mutex<Vec<ManagedChild>>,
    next_index: AtomicUsize,
    exit_tx: mpsc::UnboundedSender<ChildExit>,
    exit_rx: Mutex<mpsc::UnboundedReceiver<ChildExit>>,
    cleanup: Option<CleanupCommand>,
    killed: AtomicBool,
}

impl Supervisor {
    pub fn new(cleanup: Option<CleanupCommand>) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            children: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(1),
            exit_tx,
            exit_rx: Mutex::new(exit_rx),
            cleanup,
            killed: AtomicBool::new(false),
        }
    }

    pub async fn spawn(&self, spec: SpawnSpec) -> Result<Batch, SpinError> {
        self.spawn_batch(vec![spec]).await
    }

    /// Spawns every spec and returns their combined output.
    ///
    /// Children spawned before a failing one stay tracked, so `kill_all`
    /// still reaches them.
    pub async fn spawn_batch(&self, specs: Vec<SpawnSpec>) -> Result<Batch, SpinError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut labels = Vec::with_capacity(specs.len());
        for spec in specs {
            labels.push(spec.label.clone());
            self.spawn_one(spec, tx.clone()).await?;
        }
        Ok(Batch {
            labels,
            events: rx,
        })
    }

    async fn spawn_one(
        &self,
        spec: SpawnSpec,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Result<(), SpinError> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(SpinError::SpawnFailed {
                program: spec.program,
                message: "supervisor is shutting down".to_string(),
            });
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdin(if spec.stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => SpinError::ExecutableNotFound {
                program: spec.program.clone(),
            },
            _ => SpinError::SpawnFailed {
                program: spec.program.clone(),
                message: err.to_string(),
            },
        })?;

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        tracing::info!(
            process = %spec.label,
            program = %spec.program,
            index,
            pid = ?pid,
            args = ?spec.args,
            "spawned child process"
        );

        if let (Some(payload), Some(mut stdin)) = (spec.stdin_payload.as_ref(), child.stdin.take()) {
            if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                tracing::error!(process = %spec.label, error = %err, "failed to write child stdin");
                terminate(&mut child);
                return Err(SpinError::SpawnFailed {
                    program: spec.program,
                    message: format!("failed to write stdin: {err}"),
                });
            }
            // dropping closes the pipe
            drop(stdin);
        }

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                spec.label.clone(),
                StreamKind::Stdout,
                stdout,
                events.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                spec.label.clone(),
                StreamKind::Stderr,
                stderr,
                events.clone(),
            ));
        }

        let child = Arc::new(Mutex::new(Some(child)));
        let alive = Arc::new(AtomicBool::new(true));
        self.spawn_monitor(
            spec.label.clone(),
            index,
            child.clone(),
            alive.clone(),
            readers,
            events,
        );

        self.children.lock().await.push(ManagedChild {
            info: ChildInfo {
                index,
                label: spec.label,
                program: spec.program,
                pid,
                alive: true,
            },
            child,
            alive,
        });
        Ok(())
    }

    fn spawn_monitor(
        &self,
        label: String,
        index: usize,
        child: Arc<Mutex<Option<Child>>>,
        alive: Arc<AtomicBool>,
        readers: Vec<JoinHandle<()>>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) {
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let status = loop {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                let mut guard = child.lock().await;
                let Some(running) = guard.as_mut() else {
                    return;
                };
                match running.try_wait() {
                    Ok(Some(status)) => {
                        *guard = None;
                        break status;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(process = %label, error = %err, "failed to poll child process");
                        return;
                    }
                }
            };
            alive.store(false, Ordering::SeqCst);

            // Let the readers forward what the child printed before exiting.
            for reader in readers {
                let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
            }

            let exit = ChildExit {
                process: label.clone(),
                index,
                exit_code: status.code(),
                status: status.to_string(),
            };
            if status.success() {
                tracing::info!(process = %label, index, status = %exit.status, "child process exited");
            } else {
                tracing::warn!(process = %label, index, status = %exit.status, "child process exited");
            }
            let _ = events.send(SupervisorEvent::Exited(exit.clone()));
            let _ = exit_tx.send(exit);
        });
    }

    /// Snapshot of every child spawned so far.
    pub async fn children(&self) -> Vec<ChildInfo> {
        self.children
            .lock()
            .await
            .iter()
            .map(|managed| ChildInfo {
                alive: managed.alive.load(Ordering::SeqCst),
                ..managed.info.clone()
            })
            .collect()
    }

    /// Resolves with the next child that exits for any reason.
    pub async fn wait_for_exit(&self) -> Option<ChildExit> {
        self.exit_rx.lock().await.recv().await
    }

    /// Signals every tracked child to terminate, then runs the cleanup command.
    ///
    /// Only the first call does anything. It does not wait for children to exit.
    pub async fn kill_all(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let children = self.children.lock().await;
        for managed in children.iter() {
            let mut guard = managed.child.lock().await;
            let Some(child) = guard.as_mut() else {
                continue;
            };
            tracing::info!(process = %managed.info.label, index = managed.info.index, "terminating child process");
            terminate(child);
        }
        drop(children);

        if let Some(cleanup) = &self.cleanup {
            run_cleanup(cleanup).await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            return;
        }
    }
    let _ = child.start_kill();
}

async fn run_cleanup(cleanup: &CleanupCommand) {
    tracing::info!(program = %cleanup.program, args = ?cleanup.args, "running cleanup command");
    let status = Command::new(&cleanup.program)
        .args(&cleanup.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(program = %cleanup.program, status = %status, "cleanup command failed"),
        Err(err) => tracing::warn!(program = %cleanup.program, error = %err, "failed to run cleanup command"),
    }
}

fn spawn_reader<R>(
    process: String,
    stream: StreamKind,
    reader: R,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut scanner = LineScanner::new(reader);
        loop {
            match scanner.next_line().await {
                Ok(Some(line)) => {
                    match stream {
                        StreamKind::Stdout => tracing::info!(process = %process, "{}", line),
                        StreamKind::Stderr => tracing::warn!(process = %process, stream = %stream, "{}", line),
                    }
                    // nobody listens once the batch is ready
                    let _ = events.send(SupervisorEvent::Line {
                        process: process.clone(),
                        stream,
                        line,
                    });
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = events.send(SupervisorEvent::StreamFailed {
                        process: process.clone(),
                        message: err.to_string(),
                    });
                    break;
                }
            }
        }
    })
}
