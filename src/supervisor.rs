//! Supervises one measured server instance per iteration.
//!
//! The counter wrapper is spawned with the server binary as its target, the
//! real server process is found among the wrapper's descendants, and on a
//! stop signal the active session process (or, failing that, the server
//! itself) is killed so the wrapper exits and prints its counters.
//!
//! Phases run strictly in order:
//! `Idle -> Launching -> DiscoveringWorker -> Running -> StopRequested -> Terminating -> Collected`.
//! A wrapper that dies while `Running` skips straight to `Collected`.

use crate::config::{BenchConfig, PerfConfig, ServerConfig};
use crate::proctree::{descendants, matches_binary, ProcFs, ProcessState, ProcessTable};
use crate::signals::Shutdown;
use crate::sync::{ChannelError, SyncChannel, WaitOutcome};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Launching,
    DiscoveringWorker,
    Running,
    StopRequested,
    Terminating,
    Collected,
}

/// Output of one supervised run, ready for metric extraction.
#[derive(Debug)]
pub struct Collected {
    /// Everything the wrapper wrote to stderr.
    pub output: String,
    /// The wrapper exited before a stop signal was observed.
    pub premature_exit: bool,
    pub exit_code: Option<i32>,
}

/// Which process the stop handler killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminated {
    Session(u32),
    /// No running session process was found; the whole worker was killed.
    Worker(u32),
    AlreadyGone,
}

#[derive(Debug)]
pub enum SupervisorError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
    WorkerDiscoveryFailed {
        binary: PathBuf,
        attempts: u32,
    },
    Channel(ChannelError),
    Io {
        source: std::io::Error,
    },
    Cancelled,
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn { program, source } => {
                write!(f, "failed to spawn wrapper {program}: {source}")
            }
            SupervisorError::WorkerDiscoveryFailed { binary, attempts } => write!(
                f,
                "no {} process appeared under the wrapper after {attempts} attempts",
                binary.display()
            ),
            SupervisorError::Channel(e) => write!(f, "{e}"),
            SupervisorError::Io { source } => write!(f, "I/O error supervising server: {source}"),
            SupervisorError::Cancelled => write!(f, "supervision cancelled"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::Channel(e) => Some(e),
            SupervisorError::Io { source } => Some(source),
            SupervisorError::WorkerDiscoveryFailed { .. } | SupervisorError::Cancelled => None,
        }
    }
}

impl From<ChannelError> for SupervisorError {
    fn from(e: ChannelError) -> Self {
        SupervisorError::Channel(e)
    }
}

/// The wrapper process and its captured stderr.
struct SupervisedProcess {
    wrapper: Child,
    pid: u32,
    stderr: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl SupervisedProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.wrapper.try_wait(), Ok(None))
    }

    /// Hand off captured output. Waits up to `timeout` for the pipe to close.
    async fn drain(&mut self, timeout: Duration) -> String {
        if tokio::time::timeout(timeout, &mut self.reader).await.is_err() {
            tracing::warn!(pid = self.pid, "stderr still open after wrapper exit, using partial output");
            self.reader.abort();
        }
        let bytes = {
            let mut buf = self.stderr.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *buf)
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Kill anything still left in the wrapper's process group.
    fn sweep(&self) {
        match killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pgid = self.pid, "killed leftover process group members"),
            Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!(pgid = self.pid, error = %e, "process group sweep failed"),
        }
    }
}

pub struct ProcessSupervisor<T: ProcessTable = ProcFs> {
    perf: PerfConfig,
    server: ServerConfig,
    poll_interval: Duration,
    table: T,
}

impl ProcessSupervisor<ProcFs> {
    pub fn new(config: &BenchConfig) -> Self {
        Self::with_table(config, ProcFs)
    }
}

impl<T: ProcessTable> ProcessSupervisor<T> {
    pub fn with_table(config: &BenchConfig, table: T) -> Self {
        Self {
            perf: config.perf.clone(),
            server: config.server.clone(),
            poll_interval: config.sync.poll_interval(),
            table,
        }
    }

    fn enter(&self, phase: Phase, pid: Option<u32>) {
        tracing::debug!(?phase, pid, "supervisor phase");
    }

    /// Run one full launch/discover/run/stop/collect cycle.
    pub async fn run_iteration(
        &self,
        channel: &SyncChannel,
        shutdown: &Shutdown,
    ) -> Result<Collected, SupervisorError> {
        self.enter(Phase::Idle, None);
        self.enter(Phase::Launching, None);
        let mut process = self.launch()?;

        self.enter(Phase::DiscoveringWorker, Some(process.pid));
        let worker = {
            let wrapper = &mut process.wrapper;
            self.discover_worker(process.pid, || matches!(wrapper.try_wait(), Ok(None)), shutdown)
                .await
        };
        let worker = match worker {
            Ok(pid) => pid,
            Err(SupervisorError::Cancelled) => {
                self.interrupt(&mut process, None).await;
                return Err(SupervisorError::Cancelled);
            }
            Err(e) => {
                self.force_stop(&mut process).await;
                return Err(e);
            }
        };

        self.enter(Phase::Running, Some(worker));
        let outcome = {
            let wrapper = &mut process.wrapper;
            channel
                .wait_for_signal(
                    self.poll_interval,
                    || matches!(wrapper.try_wait(), Ok(None)),
                    shutdown,
                )
                .await
        };

        let premature_exit = match outcome {
            Ok(WaitOutcome::Signaled) => {
                tracing::info!(worker, "stop signal received");
                self.enter(Phase::StopRequested, Some(worker));
                let terminated = self.terminate(worker);
                self.enter(Phase::Terminating, Some(worker));
                tracing::debug!(?terminated, "stop handled");
                false
            }
            Ok(WaitOutcome::Aborted) => {
                tracing::warn!(
                    pid = process.pid,
                    "wrapper exited before a stop signal, recording partial sample"
                );
                true
            }
            Ok(WaitOutcome::Cancelled) => {
                self.interrupt(&mut process, Some(worker)).await;
                return Err(SupervisorError::Cancelled);
            }
            Err(e) => {
                self.force_stop(&mut process).await;
                return Err(e.into());
            }
        };

        let collected = self.collect(&mut process, worker, premature_exit, shutdown).await?;
        self.enter(Phase::Collected, Some(process.pid));

        if let Err(e) = channel.reset().await {
            tracing::warn!(error = %e, "failed to clear stop signal after collection");
        }
        Ok(collected)
    }

    /// Spawn the wrapper in its own process group with stderr captured.
    fn launch(&self) -> Result<SupervisedProcess, SupervisorError> {
        let argv = self.perf.wrap(&self.server.binary, &self.server.args);
        let program = argv[0].clone();
        tracing::info!(command = ?argv, "launching server under counter wrapper");

        let mut wrapper = Command::new(&program)
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        let pid = wrapper.id().ok_or_else(|| SupervisorError::Io {
            source: std::io::Error::new(std::io::ErrorKind::Other, "wrapper exited immediately"),
        })?;
        tracing::debug!(pid, "wrapper started");

        let stderr = Arc::new(Mutex::new(Vec::new()));
        let reader = match wrapper.stderr.take() {
            Some(mut pipe) => {
                let sink = stderr.clone();
                tokio::spawn(async move {
                    let mut chunk = [0u8; 4096];
                    loop {
                        match pipe.read(&mut chunk).await {
                            Ok(0) => break,
                            Ok(n) => sink
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .extend_from_slice(&chunk[..n]),
                            Err(e) => {
                                tracing::debug!(error = %e, "wrapper stderr read failed");
                                break;
                            }
                        }
                    }
                })
            }
            None => tokio::spawn(async {}),
        };

        Ok(SupervisedProcess {
            wrapper,
            pid,
            stderr,
            reader,
        })
    }

    /// Poll the wrapper's descendants for the configured server binary.
    ///
    /// The worker may not have forked yet, so every attempt waits one interval
    /// first. Gives up early if `alive` reports the wrapper gone.
    pub async fn discover_worker<F>(
        &self,
        wrapper_pid: u32,
        mut alive: F,
        shutdown: &Shutdown,
    ) -> Result<u32, SupervisorError>
    where
        F: FnMut() -> bool,
    {
        let attempts = self.server.discovery_attempts;
        for attempt in 1..=attempts {
            tokio::select! {
                _ = tokio::time::sleep(self.server.discovery_interval()) => {}
                _ = shutdown.cancelled() => return Err(SupervisorError::Cancelled),
            }

            if !alive() {
                tracing::warn!(wrapper_pid, attempt, "wrapper exited during worker discovery");
                break;
            }

            match self.table.snapshot() {
                Ok(table) => {
                    if let Some(worker) = descendants(&table, wrapper_pid)
                        .into_iter()
                        .find(|p| matches_binary(p, &self.server.binary))
                    {
                        tracing::info!(pid = worker.pid, attempt, "found worker process");
                        return Ok(worker.pid);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "process table snapshot failed"),
            }
            tracing::debug!(attempt, attempts, "worker not found yet");
        }

        Err(SupervisorError::WorkerDiscoveryFailed {
            binary: self.server.binary.clone(),
            attempts,
        })
    }

    /// Kill the running session process under `worker`, or the worker itself.
    pub fn terminate(&self, worker: u32) -> Terminated {
        let session = match self.table.snapshot() {
            Ok(table) => descendants(&table, worker)
                .into_iter()
                .find(|p| p.state == ProcessState::Running),
            Err(e) => {
                tracing::debug!(error = %e, "process table snapshot failed at stop");
                None
            }
        };

        let (target, pid) = match session {
            Some(p) => {
                tracing::debug!(pid = p.pid, comm = %p.comm, "killing active session process");
                (Terminated::Session(p.pid), p.pid)
            }
            None => {
                tracing::debug!(
                    worker,
                    "no running session process found, killing worker process"
                );
                (Terminated::Worker(worker), worker)
            }
        };

        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => target,
            Err(Errno::ESRCH) => {
                tracing::debug!(pid, "process already gone, wrapper should exit shortly");
                Terminated::AlreadyGone
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to kill process");
                target
            }
        }
    }

    /// Wait for the wrapper to exit (bounded), then drain its output once.
    ///
    /// Shutdown while waiting abandons the sample: the wrapper is interrupted
    /// and nothing is handed back for recording.
    async fn collect(
        &self,
        process: &mut SupervisedProcess,
        worker: u32,
        premature_exit: bool,
        shutdown: &Shutdown,
    ) -> Result<Collected, SupervisorError> {
        let timeout = self.server.exit_timeout();
        let waited = tokio::select! {
            res = tokio::time::timeout(timeout, process.wrapper.wait()) => Some(res),
            _ = shutdown.cancelled() => None,
        };

        let status = match waited {
            Some(Ok(Ok(status))) => Some(status),
            Some(Ok(Err(e))) => return Err(SupervisorError::Io { source: e }),
            Some(Err(_)) => {
                tracing::warn!(
                    pid = process.pid,
                    timeout_secs = timeout.as_secs(),
                    "timed out waiting for wrapper exit, killing it"
                );
                None
            }
            None => {
                tracing::info!(pid = process.pid, "shutdown while waiting for wrapper exit");
                self.interrupt(process, Some(worker)).await;
                return Err(SupervisorError::Cancelled);
            }
        };

        let exit_code = match status {
            Some(status) => status.code(),
            None => {
                self.force_stop(process).await;
                None
            }
        };
        process.sweep();

        let output = process.drain(timeout).await;
        tracing::debug!(
            pid = process.pid,
            exit_code,
            output_bytes = output.len(),
            "wrapper collected"
        );
        Ok(Collected {
            output,
            premature_exit,
            exit_code,
        })
    }

    /// Graceful stop: SIGINT the wrapper (and worker), wait, then force.
    async fn interrupt(&self, process: &mut SupervisedProcess, worker: Option<u32>) {
        tracing::info!(pid = process.pid, "interrupting wrapper");
        for pid in std::iter::once(process.pid).chain(worker) {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                tracing::debug!(pid, error = %e, "SIGINT failed");
            }
        }
        match tokio::time::timeout(self.server.exit_timeout(), process.wrapper.wait()).await {
            Ok(_) => process.sweep(),
            Err(_) => self.force_stop(process).await,
        }
    }

    /// SIGKILL the wrapper's whole process group and reap the wrapper.
    async fn force_stop(&self, process: &mut SupervisedProcess) {
        if !process.is_alive() {
            process.sweep();
            return;
        }
        process.sweep();
        if let Err(e) = process.wrapper.kill().await {
            tracing::debug!(pid = process.pid, error = %e, "wrapper kill failed");
        }
    }
}
