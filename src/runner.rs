//! Iteration loops for the client and server roles.
//!
//! Each loop runs until `iterations` samples have been persisted. Only the
//! client's measurement step is retried in place; everything else that goes
//! wrong is structural and ends the run with the rows collected so far.

use crate::config::BenchConfig;
use crate::metrics::{MetricRecord, MetricsExtractor, Role, SampleStatus};
use crate::ports::{port_in_use, wait_until_ready, Readiness};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::signals::Shutdown;
use crate::store::{ResultStore, StoreError};
use crate::supervisor::{ProcessSupervisor, SupervisorError};
use crate::sync::{ChannelError, SyncChannel};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug)]
pub enum RunError {
    /// Measured client command exceeded its timeout.
    MeasurementTimeout { timeout_secs: u64 },
    /// Measured client command exited non-zero.
    MeasurementFailed { exit_code: Option<i32> },
    /// Readiness probe never got a connection.
    ServerNotReady { host: String, port: u16 },
    PortInUse { port: u16 },
    Spawn {
        program: String,
        source: std::io::Error,
    },
    Io { source: std::io::Error },
    Channel(ChannelError),
    Supervisor(SupervisorError),
    Store(StoreError),
    Cancelled,
}

impl RunError {
    /// Transient failures are retried in place; everything else ends the run.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RunError::MeasurementTimeout { .. }
                | RunError::MeasurementFailed { .. }
                | RunError::ServerNotReady { .. }
        )
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::MeasurementTimeout { timeout_secs } => {
                write!(f, "measurement timed out after {timeout_secs}s")
            }
            RunError::MeasurementFailed { exit_code } => match exit_code {
                Some(code) => write!(f, "measurement failed with exit code {code}"),
                None => write!(f, "measurement killed by signal"),
            },
            RunError::ServerNotReady { host, port } => {
                write!(f, "server at {host}:{port} not accepting connections")
            }
            RunError::PortInUse { port } => write!(f, "port {port} is already in use"),
            RunError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            RunError::Io { source } => write!(f, "I/O error: {source}"),
            RunError::Channel(e) => write!(f, "{e}"),
            RunError::Supervisor(e) => write!(f, "{e}"),
            RunError::Store(e) => write!(f, "{e}"),
            RunError::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Spawn { source, .. } | RunError::Io { source } => Some(source),
            RunError::Channel(e) => Some(e),
            RunError::Supervisor(e) => Some(e),
            RunError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ChannelError> for RunError {
    fn from(e: ChannelError) -> Self {
        RunError::Channel(e)
    }
}

impl From<StoreError> for RunError {
    fn from(e: StoreError) -> Self {
        RunError::Store(e)
    }
}

impl From<SupervisorError> for RunError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::Cancelled => RunError::Cancelled,
            other => RunError::Supervisor(other),
        }
    }
}

/// What a finished (or interrupted) run produced.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub recorded: u64,
    pub aborted: u64,
    pub retries: u64,
    pub cancelled: bool,
    pub output: PathBuf,
}

pub struct BenchmarkLoop {
    config: BenchConfig,
    extractor: MetricsExtractor,
    store: ResultStore,
    shutdown: Shutdown,
}

impl BenchmarkLoop {
    pub fn new(config: BenchConfig, store: ResultStore, shutdown: Shutdown) -> Self {
        let extractor = MetricsExtractor::new(&config.perf.events);
        Self {
            config,
            extractor,
            store,
            shutdown,
        }
    }

    pub async fn run(&self, role: Role) -> Result<RunSummary, RunError> {
        match role {
            Role::Client => self.run_client().await,
            Role::Server => self.run_server().await,
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            output: self.store.path().to_path_buf(),
            ..Default::default()
        }
    }

    /// Iteration indices for this run, continuing after rows already in the file.
    fn indices(&self) -> std::ops::Range<u64> {
        let start = self.store.existing_rows();
        start..start + u64::from(self.config.run.iterations)
    }

    /// Sleep between iterations. Returns false if shutdown was requested.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.shutdown.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }

    pub async fn run_server(&self) -> Result<RunSummary, RunError> {
        let mut summary = self.summary();
        if let Some(port) = self.config.server.port {
            if port_in_use(port) {
                return Err(RunError::PortInUse { port });
            }
        }

        // Listener (socket strategy) must exist before any client signals.
        let channel = SyncChannel::for_server(&self.config.sync)?;
        let supervisor = ProcessSupervisor::new(&self.config);
        let pause = Duration::from_millis(self.config.run.pause_ms);
        let indices = self.indices();
        let first = indices.start;

        for iteration in indices {
            if iteration > first && !self.pause(pause).await {
                summary.cancelled = true;
                break;
            }
            if self.shutdown.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if let Some(port) = self.config.server.port {
                if port_in_use(port) {
                    return Err(RunError::PortInUse { port });
                }
            }
            channel.reset().await?;

            tracing::info!(iteration, "starting server iteration");
            let collected = match supervisor.run_iteration(&channel, &self.shutdown).await {
                Ok(c) => c,
                Err(SupervisorError::Cancelled) => {
                    summary.cancelled = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            let status = if collected.premature_exit {
                summary.aborted += 1;
                SampleStatus::Aborted
            } else {
                SampleStatus::Complete
            };
            let record = MetricRecord::new(
                iteration,
                Role::Server,
                self.extractor.parse(&collected.output),
                status,
            );
            self.store.append(&record)?;
            summary.recorded += 1;
            tracing::info!(iteration, status = status.as_str(), "server sample recorded");
        }

        Ok(summary)
    }

    pub async fn run_client(&self) -> Result<RunSummary, RunError> {
        let mut summary = self.summary();
        let channel = SyncChannel::for_client(&self.config.sync);
        let client = &self.config.client;
        let mut policy = RetryPolicy::new(client.retry_delay_secs, client.max_retry_delay_secs);
        let pause = Duration::from_millis(self.config.run.pause_ms);
        let indices = self.indices();
        let first = indices.start;

        'iterations: for iteration in indices {
            if iteration > first && !self.pause(pause).await {
                summary.cancelled = true;
                break;
            }
            policy.reset();

            let output = loop {
                if self.shutdown.is_cancelled() {
                    summary.cancelled = true;
                    break 'iterations;
                }
                tracing::info!(iteration, attempt = policy.current_attempt(), "measuring client");
                match self.measure_client().await {
                    Ok(output) => break output,
                    Err(RunError::Cancelled) => {
                        summary.cancelled = true;
                        break 'iterations;
                    }
                    Err(e) => match policy.evaluate(&e) {
                        RetryDecision::Retry { delay, .. } => {
                            summary.retries += 1;
                            if !self.pause(delay).await {
                                summary.cancelled = true;
                                break 'iterations;
                            }
                        }
                        RetryDecision::Abort => return Err(e),
                    },
                }
            };

            let record = MetricRecord::new(
                iteration,
                Role::Client,
                self.extractor.parse(&output),
                SampleStatus::Complete,
            );
            self.store.append(&record)?;
            summary.recorded += 1;
            tracing::info!(iteration, "client sample recorded");

            if client.signal_server {
                channel.signal().await?;
            }
        }

        Ok(summary)
    }

    /// One attempt: readiness probe, then the client command under the wrapper.
    /// Returns the wrapper's stderr.
    async fn measure_client(&self) -> Result<String, RunError> {
        let client = &self.config.client;

        if let Some(readiness) = &client.readiness {
            match wait_until_ready(
                &readiness.host,
                readiness.port,
                Duration::from_secs(readiness.timeout_secs),
                &self.shutdown,
            )
            .await
            {
                Readiness::Ready => {}
                Readiness::TimedOut => {
                    return Err(RunError::ServerNotReady {
                        host: readiness.host.clone(),
                        port: readiness.port,
                    })
                }
                Readiness::Cancelled => return Err(RunError::Cancelled),
            }
        }

        let argv = self.config.perf.wrap(&client.binary, &client.args);
        tracing::debug!(command = ?argv, "running measured client");
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunError::Spawn {
                program: argv[0].clone(),
                source: e,
            })?;
        let pgid = child.id();

        let timeout = Duration::from_secs(client.timeout_secs);
        let waited = tokio::select! {
            res = tokio::time::timeout(timeout, child.wait_with_output()) => Some(res),
            _ = self.shutdown.cancelled() => None,
        };
        let output = match waited {
            Some(Ok(Ok(output))) => output,
            Some(Ok(Err(e))) => {
                kill_group(pgid);
                return Err(RunError::Io { source: e });
            }
            Some(Err(_)) => {
                kill_group(pgid);
                return Err(RunError::MeasurementTimeout {
                    timeout_secs: client.timeout_secs,
                });
            }
            None => {
                kill_group(pgid);
                return Err(RunError::Cancelled);
            }
        };

        if !output.status.success() {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "measured client failed"
            );
            return Err(RunError::MeasurementFailed {
                exit_code: output.status.code(),
            });
        }
        tracing::debug!(stdout_bytes = output.stdout.len(), "measured client finished");
        Ok(String::from_utf8_lossy(&output.stderr).into_owned())
    }
}

/// SIGKILL everything left in an abandoned client's process group.
fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid else {
        return;
    };
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pgid, "killed measured client process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "failed to kill measured client"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncStrategy;
    use crate::proctree::{ProcFs, ProcessState, ProcessTable};
    use crate::supervisor::tests::{slow_reporting, test_config};
    use std::path::Path;
    use std::time::Instant;

    fn client_config(dir: &Path, script: &str) -> BenchConfig {
        let mut config = test_config(dir, "true");
        config.client.binary = PathBuf::from("sh");
        config.client.args = vec!["-c".to_string(), script.to_string()];
        config.client.timeout_secs = 5;
        config.client.retry_delay_secs = 0;
        config.client.max_retry_delay_secs = 0;
        config.client.signal_server = false;
        config
    }

    fn open_store(dir: &Path, config: &BenchConfig) -> ResultStore {
        ResultStore::open(&dir.join("results.csv"), &config.perf.events).unwrap()
    }

    fn read_pid(path: &Path) -> u32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    /// Waits briefly for `pid` to disappear; reaped or zombie both count.
    fn assert_process_gone(pid: u32) {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let running = ProcFs.snapshot().unwrap().into_iter().any(|p| {
                p.pid == pid && !matches!(p.state, ProcessState::Zombie | ProcessState::Dead)
            });
            if !running {
                return;
            }
            assert!(Instant::now() < deadline, "process {pid} still running");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn rows(dir: &Path) -> Vec<Vec<String>> {
        let contents = std::fs::read_to_string(dir.join("results.csv")).unwrap();
        contents
            .lines()
            .skip(1)
            .map(|l| l.split(',').map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_error_taxonomy() {
        assert!(RunError::MeasurementTimeout { timeout_secs: 5 }.is_transient());
        assert!(RunError::MeasurementFailed { exit_code: Some(255) }.is_transient());
        assert!(RunError::ServerNotReady {
            host: "h".into(),
            port: 1
        }
        .is_transient());
        assert!(!RunError::PortInUse { port: 2222 }.is_transient());
        assert!(!RunError::Supervisor(SupervisorError::WorkerDiscoveryFailed {
            binary: PathBuf::from("sshd"),
            attempts: 10
        })
        .is_transient());
        assert!(!RunError::Cancelled.is_transient());
    }

    #[test]
    fn test_supervisor_cancel_maps_to_run_cancel() {
        let err: RunError = SupervisorError::Cancelled.into();
        assert!(matches!(err, RunError::Cancelled));
    }

    #[tokio::test]
    async fn test_client_records_exactly_n_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = client_config(dir.path(), "true");
        config.run.iterations = 3;
        let store = open_store(dir.path(), &config);
        let (_trigger, shutdown) = Shutdown::new();

        let summary = BenchmarkLoop::new(config, store, shutdown)
            .run(Role::Client)
            .await
            .unwrap();

        assert_eq!(summary.recorded, 3);
        assert_eq!(summary.retries, 0);
        let rows = rows(dir.path());
        let iterations: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
        assert_eq!(iterations, vec!["0", "1", "2"]);
        for row in &rows {
            assert_eq!(row[2], "1234");
            assert_eq!(row[3], "567");
            assert_eq!(row[4], "0.5");
            assert_eq!(row[7], "ok");
        }
    }

    #[tokio::test]
    async fn test_client_retries_failures_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let count = dir.path().join("count");
        // Fail the first two attempts, succeed afterwards.
        let script = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); echo $((n+1)) > {c}; [ \"$n\" -ge 2 ]",
            c = count.display()
        );
        let mut config = client_config(dir.path(), &script);
        config.run.iterations = 2;
        let store = open_store(dir.path(), &config);
        let (_trigger, shutdown) = Shutdown::new();

        let summary = BenchmarkLoop::new(config, store, shutdown)
            .run_client()
            .await
            .unwrap();

        assert_eq!(summary.recorded, 2);
        assert_eq!(summary.retries, 2);
        let iterations: Vec<String> = rows(dir.path()).into_iter().map(|r| r[0].clone()).collect();
        assert_eq!(iterations, vec!["0", "1"]);
    }

    #[tokio::test]
    async fn test_client_timeout_retries_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let count = dir.path().join("count");
        let pidfile = dir.path().join("pid");
        let script = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); echo $((n+1)) > {c}; \
             if [ \"$n\" = 0 ]; then echo $$ > {p}; exec sleep 30; fi",
            c = count.display(),
            p = pidfile.display()
        );
        let mut config = client_config(dir.path(), &script);
        config.run.iterations = 1;
        config.client.timeout_secs = 1;
        let store = open_store(dir.path(), &config);
        let (_trigger, shutdown) = Shutdown::new();

        let summary = BenchmarkLoop::new(config, store, shutdown)
            .run_client()
            .await
            .unwrap();

        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.retries, 1);
        assert_eq!(rows(dir.path()).len(), 1);
        assert_process_gone(read_pid(&pidfile));
    }

    #[tokio::test]
    async fn test_client_cancel_kills_measured_command() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 30", pidfile.display());
        let mut config = client_config(dir.path(), &script);
        config.client.timeout_secs = 60;
        let store = open_store(dir.path(), &config);
        let (trigger, shutdown) = Shutdown::new();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            trigger.trigger();
        });
        let summary = tokio::time::timeout(
            Duration::from_secs(10),
            BenchmarkLoop::new(config, store, shutdown).run_client(),
        )
        .await
        .unwrap()
        .unwrap();
        canceller.await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.recorded, 0);
        assert!(rows(dir.path()).is_empty());
        assert_process_gone(read_pid(&pidfile));
    }

    #[tokio::test]
    async fn test_client_signals_server_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = client_config(dir.path(), "true");
        config.run.iterations = 1;
        config.client.signal_server = true;
        let marker = config.sync.marker.clone();
        let store = open_store(dir.path(), &config);
        let (_trigger, shutdown) = Shutdown::new();

        BenchmarkLoop::new(config, store, shutdown)
            .run_client()
            .await
            .unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_client_spawn_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = client_config(dir.path(), "true");
        config.perf.command = vec!["nonexistent-wrapper-xyz".to_string()];
        let store = open_store(dir.path(), &config);
        let (_trigger, shutdown) = Shutdown::new();

        let err = BenchmarkLoop::new(config, store, shutdown)
            .run_client()
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
        assert!(rows(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_client_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path(), "true");
        let store = open_store(dir.path(), &config);
        let (trigger, shutdown) = Shutdown::new();
        trigger.trigger();

        let summary = BenchmarkLoop::new(config, store, shutdown)
            .run_client()
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.recorded, 0);
        assert!(rows(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_client_resumes_numbering_in_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = client_config(dir.path(), "true");
        config.run.iterations = 2;

        for _ in 0..2 {
            let store = open_store(dir.path(), &config);
            let (_trigger, shutdown) = Shutdown::new();
            BenchmarkLoop::new(config.clone(), store, shutdown)
                .run_client()
                .await
                .unwrap();
        }

        let iterations: Vec<String> = rows(dir.path()).into_iter().map(|r| r[0].clone()).collect();
        assert_eq!(iterations, vec!["0", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_server_premature_exit_is_recorded_and_loop_continues() {
        let dir = tempfile::tempdir().unwrap();
        let count = dir.path().join("count");
        let marker = dir.path().join("stop");
        // Iteration 3's worker dies on its own; every other one raises the stop marker.
        let worker = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); echo $((n+1)) > {c}; \
             if [ \"$n\" = 3 ]; then sleep 0.4; exit 0; fi; \
             sleep 0.3; touch {m}; sleep 5 2>/dev/null",
            c = count.display(),
            m = marker.display()
        );
        let mut config = test_config(dir.path(), &worker);
        config.run.iterations = 5;
        let store = open_store(dir.path(), &config);
        let (_trigger, shutdown) = Shutdown::new();

        let summary = tokio::time::timeout(
            Duration::from_secs(60),
            BenchmarkLoop::new(config, store, shutdown).run(Role::Server),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(summary.recorded, 5);
        assert_eq!(summary.aborted, 1);
        let rows = rows(dir.path());
        let iterations: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
        assert_eq!(iterations, vec!["0", "1", "2", "3", "4"]);
        let statuses: Vec<&str> = rows.iter().map(|r| r[7].as_str()).collect();
        assert_eq!(statuses, vec!["ok", "ok", "ok", "aborted", "ok"]);
        assert_eq!(rows[3][2], "1234");
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_server_port_in_use_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let mut config = test_config(dir.path(), "true");
        config.server.port = Some(listener.local_addr().unwrap().port());
        let store = open_store(dir.path(), &config);
        let (_trigger, shutdown) = Shutdown::new();

        let err = BenchmarkLoop::new(config, store, shutdown)
            .run_server()
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::PortInUse { .. }));
        assert!(!err.is_transient());
        assert!(rows(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_server_discovery_failure_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), "sleep 2");
        config.server.binary = PathBuf::from("/usr/sbin/definitely-not-running");
        config.server.discovery_attempts = 2;
        config.run.iterations = 3;
        let store = open_store(dir.path(), &config);
        let (_trigger, shutdown) = Shutdown::new();

        let err = BenchmarkLoop::new(config, store, shutdown)
            .run_server()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Supervisor(SupervisorError::WorkerDiscoveryFailed { .. })
        ));
        assert!(rows(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_server_cancel_during_collection_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stop");
        let worker = format!("sleep 0.3; touch {}; sleep 5 2>/dev/null", marker.display());
        let mut config = test_config(dir.path(), &worker);
        slow_reporting(&mut config);
        config.run.iterations = 3;
        let store = open_store(dir.path(), &config);
        let (trigger, shutdown) = Shutdown::new();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            trigger.trigger();
        });
        let summary = tokio::time::timeout(
            Duration::from_secs(20),
            BenchmarkLoop::new(config, store, shutdown).run_server(),
        )
        .await
        .unwrap()
        .unwrap();
        canceller.await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.recorded, 0);
        assert!(rows(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_socket_strategy_client_stops_server_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut server_config = test_config(dir.path(), "sleep 30 2>/dev/null; exit 0");
        server_config.run.iterations = 1;
        server_config.sync.strategy = SyncStrategy::Socket;
        server_config.sync.host = "127.0.0.1".to_string();
        server_config.sync.port = port;

        let mut client_cfg = client_config(dir.path(), "true");
        client_cfg.run.iterations = 1;
        client_cfg.client.signal_server = true;
        client_cfg.sync = server_config.sync.clone();

        let server_store = open_store(dir.path(), &server_config);
        let client_store =
            ResultStore::open(&dir.path().join("client.csv"), &client_cfg.perf.events).unwrap();
        let (_trigger, shutdown) = Shutdown::new();
        let server = BenchmarkLoop::new(server_config, server_store, shutdown.clone());
        let client = BenchmarkLoop::new(client_cfg, client_store, shutdown);

        let start = Instant::now();
        let (server_summary, client_summary) = tokio::time::timeout(Duration::from_secs(20), async {
            tokio::join!(server.run_server(), async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                client.run_client().await
            })
        })
        .await
        .unwrap();

        let server_summary = server_summary.unwrap();
        let client_summary = client_summary.unwrap();
        assert_eq!(server_summary.recorded, 1);
        assert_eq!(client_summary.recorded, 1);
        assert!(start.elapsed() < Duration::from_secs(15));

        let rows = rows(dir.path());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][2], "1234");
        assert_eq!(rows[0][7], "ok");
    }
}
