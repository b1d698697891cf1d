//! Bounded pool of isolated parse workers.
//!
//! Each worker is a child process handling exactly one file. The supervisor
//! never awaits a worker: [`WorkerSupervisor::tick`] launches workers into free
//! slots and [`WorkerSupervisor::poll`] inspects them without blocking,
//! enforcing the load and overall deadlines and returning whatever finished.
//!
//! Per worker, two reader tasks forward stdout protocol lines and stderr lines
//! into an unbounded channel, and a short-lived task writes the request to
//! stdin and closes it.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{ImportError, ParseResult, WorkerMessage, WorkerRequest};
use crate::scheduler::QueueEntry;

/// Lines of worker stderr kept as crash context.
const STDERR_TAIL_LINES: usize = 40;

/// How long a worker may keep running after reporting its result.
const LINGER_GRACE: Duration = Duration::from_secs(1);

/// Pause between polls while shutting down.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Upper bound on waiting for killed workers to be reaped during shutdown.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Worker command
// ─────────────────────────────────────────────────────────────────────────────

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
    memory_limit_mb: Option<u64>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            memory_limit_mb: None,
        }
    }

    /// Build from an argv list (`[program, args...]`). `None` if empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program, args.to_vec()))
    }

    /// The running executable's hidden `parse-file` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, vec!["parse-file".to_string()]))
    }

    /// Cap the worker's address space (unix only).
    pub fn with_memory_limit(mut self, limit_mb: Option<u64>) -> Self {
        self.memory_limit_mb = limit_mb;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn build(&self) -> tokio::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;

            // Own process group so a kill also reaches the worker's children
            cmd.process_group(0);

            if let Some(limit_mb) = self.memory_limit_mb {
                let bytes = limit_mb.saturating_mul(1024 * 1024) as libc::rlim_t;
                // SAFETY: the closure runs between fork and exec and only calls
                // the async-signal-safe setrlimit.
                unsafe {
                    cmd.pre_exec(move || {
                        let limit = libc::rlimit {
                            rlim_cur: bytes,
                            rlim_max: bytes,
                        };
                        if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                            return Err(io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }
        }

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handles and results
// ─────────────────────────────────────────────────────────────────────────────

/// Pool limits and deadlines.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum concurrent workers.
    pub max_workers: usize,
    /// Deadline for the module-load phase, from worker start.
    pub load_timeout: Duration,
    /// Deadline for the whole file, from worker start.
    pub file_timeout: Duration,
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The worker reported a result.
    Reported,
    /// A deadline expired; the result is synthesized.
    TimedOut,
    /// The worker could not be started or exited without a result.
    Crashed,
    /// Killed by shutdown before it finished. Nothing should be recorded.
    Cancelled,
}

/// A finished worker, ready for the collector.
#[derive(Debug)]
pub struct CompletedWorker {
    pub file: PathBuf,
    pub result: ParseResult,
    pub outcome: WorkerOutcome,
    pub started_at: DateTime<Utc>,
    /// Wall-clock time from launch to completion.
    pub duration: Duration,
    pub exit_status: Option<ExitStatus>,
}

/// A worker that was just launched by [`WorkerSupervisor::tick`].
#[derive(Debug, Clone)]
pub struct LaunchedWorker {
    pub path: PathBuf,
    pub mtime: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
enum WorkerEvent {
    Stdout(String),
    Stderr(String),
}

/// A live worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    file: PathBuf,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    deadline: Instant,
    load_deadline: Instant,
    child: Child,
    events: UnboundedReceiver<WorkerEvent>,
    loaded: bool,
    streams_closed: bool,
    exit_status: Option<ExitStatus>,
    result: Option<ParseResult>,
    reported_at: Option<Instant>,
    stderr_tail: VecDeque<String>,
    /// Set once the worker has been killed; the slot is freed when reaped.
    terminating: Option<WorkerOutcome>,
}

impl WorkerHandle {
    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn load_deadline(&self) -> Instant {
        self.load_deadline
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.is_some()
    }

    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(WorkerEvent::Stdout(line)) => self.handle_stdout(&line),
                Ok(WorkerEvent::Stderr(line)) => {
                    debug!(file = %self.file.display(), "worker: {}", line);
                    if self.stderr_tail.len() == STDERR_TAIL_LINES {
                        self.stderr_tail.pop_front();
                    }
                    self.stderr_tail.push_back(line);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.streams_closed = true;
                    break;
                }
            }
        }
    }

    fn handle_stdout(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match WorkerMessage::from_line(line) {
            Ok(WorkerMessage::Loaded) => self.loaded = true,
            Ok(WorkerMessage::Result(result)) => {
                if self.result.is_some() {
                    warn!(file = %self.file.display(), "Worker sent more than one result, ignoring");
                    return;
                }
                self.loaded = true;
                self.result = Some(result);
                self.reported_at = Some(Instant::now());
            }
            Err(_) => {
                debug!(file = %self.file.display(), line = %line, "Ignoring non-protocol worker output");
            }
        }
    }

    fn check_exit(&mut self) {
        if self.exit_status.is_some() {
            return;
        }
        match self.child.try_wait() {
            Ok(status) => self.exit_status = status,
            Err(e) => warn!(file = %self.file.display(), error = %e, "Failed to poll worker"),
        }
    }

    fn kill(&mut self, outcome: WorkerOutcome) {
        // A reaped pid may already belong to another process
        #[cfg(unix)]
        {
            if let (Some(pid), None) = (self.pid, self.exit_status) {
                // SAFETY: plain syscall; the group was created for this worker.
                unsafe {
                    libc::killpg(pid as libc::pid_t, libc::SIGKILL);
                }
            }
        }
        if let Err(e) = self.child.start_kill() {
            debug!(file = %self.file.display(), error = %e, "start_kill failed");
        }
        self.terminating = Some(outcome);
    }

    fn timeout(&mut self, message: String) {
        warn!(file = %self.file.display(), pid = ?self.pid, "{}", message);
        self.result = Some(ParseResult::failed(
            ImportError::timeout(&self.file, message),
            self.started.elapsed(),
        ));
        self.kill(WorkerOutcome::TimedOut);
    }

    fn crash_result(&self) -> ParseResult {
        let status = match self.exit_status {
            Some(status) => status.to_string(),
            None => "unknown status".to_string(),
        };
        let traceback = if self.stderr_tail.is_empty() {
            None
        } else {
            Some(self.stderr_tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        };
        ParseResult::failed(
            ImportError::crash(
                &self.file,
                format!("Worker exited without reporting a result ({status})"),
                traceback,
            ),
            self.started.elapsed(),
        )
    }

    fn complete(self, outcome: WorkerOutcome, result: Option<ParseResult>) -> CompletedWorker {
        let result = match result {
            Some(result) => result,
            None => self.crash_result(),
        };
        CompletedWorker {
            duration: self.started.elapsed(),
            file: self.file,
            result,
            outcome,
            started_at: self.started_at,
            exit_status: self.exit_status,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Launches workers into a bounded set of slots and tracks them to completion.
#[derive(Debug)]
pub struct WorkerSupervisor {
    command: WorkerCommand,
    config: SupervisorConfig,
    workers: Vec<WorkerHandle>,
    /// Completions produced outside `poll` (spawn failures).
    finished: Vec<CompletedWorker>,
}

impl WorkerSupervisor {
    pub fn new(command: WorkerCommand, config: SupervisorConfig) -> Self {
        Self {
            command,
            config,
            workers: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Workers holding a slot, including killed ones not reaped yet.
    pub fn running(&self) -> usize {
        self.workers.len()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_workers
    }

    /// Whether no worker holds a slot and nothing awaits collection.
    pub fn is_idle(&self) -> bool {
        self.workers.is_empty() && self.finished.is_empty()
    }

    /// Whether `path` currently has a worker.
    pub fn is_processing(&self, path: &Path) -> bool {
        self.workers.iter().any(|w| w.file == path)
    }

    pub fn handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.iter()
    }

    /// Fill free slots from the front of `queue`.
    ///
    /// Entries whose file already has a worker are dropped from the queue.
    pub fn tick(&mut self, queue: &mut VecDeque<QueueEntry>) -> Vec<LaunchedWorker> {
        let mut launched = Vec::new();
        while self.workers.len() < self.config.max_workers {
            let Some(entry) = queue.pop_front() else {
                break;
            };
            if self.is_processing(&entry.path) {
                debug!(file = %entry.path.display(), "Already being processed, skipping");
                continue;
            }

            let started_at = Utc::now();
            self.launch(&entry.path, started_at);
            launched.push(LaunchedWorker {
                path: entry.path,
                mtime: entry.mtime,
                started_at,
            });
        }
        launched
    }

    fn launch(&mut self, file: &Path, started_at: DateTime<Utc>) {
        let started = Instant::now();

        let request = WorkerRequest {
            file: file.to_path_buf(),
        };
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Cannot encode worker request");
                let message = format!("Cannot encode worker request: {e}");
                self.fail_launch(file, started_at, started, message);
                return;
            }
        };

        let mut child = match self.command.build().spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    file = %file.display(),
                    program = %self.command.program.display(),
                    error = %e,
                    "Failed to start worker"
                );
                let message = format!("Failed to start worker: {e}");
                self.fail_launch(file, started_at, started, message);
                return;
            }
        };

        let pid = child.id();
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(mut stdin) = child.stdin.take() {
            let shown = file.display().to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(file = %shown, error = %e, "Worker closed stdin early");
                }
                let _ = stdin.shutdown().await;
            });
        }
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone(), WorkerEvent::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx, WorkerEvent::Stderr);
        }

        debug!(file = %file.display(), pid = ?pid, "Started worker");
        self.workers.push(WorkerHandle {
            file: file.to_path_buf(),
            pid,
            started_at,
            started,
            deadline: started + self.config.file_timeout,
            load_deadline: started + self.config.load_timeout,
            child,
            events: rx,
            loaded: false,
            streams_closed: false,
            exit_status: None,
            result: None,
            reported_at: None,
            stderr_tail: VecDeque::new(),
            terminating: None,
        });
    }

    /// Report a worker that never got started as a crash.
    fn fail_launch(
        &mut self,
        file: &Path,
        started_at: DateTime<Utc>,
        started: Instant,
        message: String,
    ) {
        self.finished.push(CompletedWorker {
            file: file.to_path_buf(),
            result: ParseResult::failed(ImportError::crash(file, message, None), started.elapsed()),
            outcome: WorkerOutcome::Crashed,
            started_at,
            duration: started.elapsed(),
            exit_status: None,
        });
    }

    /// Abandon the worker for `path`, if any.
    ///
    /// The process is killed and later returned by [`poll`](Self::poll) as
    /// [`WorkerOutcome::Cancelled`], replacing any result it already sent.
    /// Returns whether a worker was found.
    pub fn cancel(&mut self, path: &Path) -> bool {
        let Some(worker) = self.workers.iter_mut().find(|w| w.file == path) else {
            return false;
        };
        match worker.terminating {
            Some(_) => worker.terminating = Some(WorkerOutcome::Cancelled),
            None => {
                debug!(file = %path.display(), "Cancelling worker");
                worker.kill(WorkerOutcome::Cancelled);
            }
        }
        true
    }

    /// Inspect every worker without blocking and return the finished ones.
    pub fn poll(&mut self) -> Vec<CompletedWorker> {
        let mut completed = std::mem::take(&mut self.finished);
        let now = Instant::now();

        let mut index = 0;
        while index < self.workers.len() {
            if let Some(done) = self.poll_one(index, now) {
                completed.push(done);
            } else {
                index += 1;
            }
        }

        completed
    }

    fn poll_one(&mut self, index: usize, now: Instant) -> Option<CompletedWorker> {
        let worker = &mut self.workers[index];
        worker.drain_events();
        worker.check_exit();
        let exited = worker.exit_status.is_some();

        if let Some(outcome) = worker.terminating {
            if !exited {
                return None;
            }
            let worker = self.workers.swap_remove(index);
            let result = worker.result.clone();
            return Some(worker.complete(outcome, result));
        }

        if exited && worker.streams_closed {
            let worker = self.workers.swap_remove(index);
            let (outcome, result) = match worker.result.clone() {
                Some(result) => (WorkerOutcome::Reported, Some(result)),
                None => {
                    warn!(
                        file = %worker.file.display(),
                        status = ?worker.exit_status,
                        "Worker exited without reporting a result"
                    );
                    (WorkerOutcome::Crashed, None)
                }
            };
            return Some(worker.complete(outcome, result));
        }

        if let Some(reported_at) = worker.reported_at {
            if now.duration_since(reported_at) >= LINGER_GRACE {
                debug!(file = %worker.file.display(), "Worker lingered after reporting, terminating");
                worker.kill(WorkerOutcome::Reported);
            }
            return None;
        }

        if now >= worker.deadline {
            let message = format!(
                "Processing {} exceeded the file processor timeout of {:.1}s",
                worker.file.display(),
                self.config.file_timeout.as_secs_f64()
            );
            worker.timeout(message);
        } else if !worker.loaded && now >= worker.load_deadline {
            let message = format!(
                "Loading {} exceeded the import timeout of {:.1}s",
                worker.file.display(),
                self.config.load_timeout.as_secs_f64()
            );
            worker.timeout(message);
        }
        None
    }

    /// Wait up to `grace` for in-flight workers, then kill and reap the rest.
    ///
    /// Workers killed here are returned as [`WorkerOutcome::Cancelled`].
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<CompletedWorker> {
        let mut completed = Vec::new();
        let grace_end = Instant::now() + grace;

        loop {
            completed.extend(self.poll());
            if self.workers.is_empty() {
                break;
            }
            if Instant::now() >= grace_end {
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        if !self.workers.is_empty() {
            info!(workers = self.workers.len(), "Grace period over, killing remaining workers");
            for worker in self.workers.iter_mut().filter(|w| w.terminating.is_none()) {
                worker.kill(WorkerOutcome::Cancelled);
            }

            let reap_end = Instant::now() + REAP_TIMEOUT;
            while !self.workers.is_empty() && Instant::now() < reap_end {
                tokio::time::sleep(SHUTDOWN_POLL).await;
                completed.extend(self.poll());
            }
            if !self.workers.is_empty() {
                warn!(workers = self.workers.len(), "Some workers could not be reaped");
                self.workers.clear();
            }
        }

        completed
    }
}

fn spawn_reader<R>(stream: R, tx: UnboundedSender<WorkerEvent>, wrap: fn(String) -> WorkerEvent)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(wrap(line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Worker stream read failed");
                    break;
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    fn config(max_workers: usize, load: u64, file: u64) -> SupervisorConfig {
        SupervisorConfig {
            max_workers,
            load_timeout: Duration::from_millis(load),
            file_timeout: Duration::from_millis(file),
        }
    }

    fn queue(paths: &[&str]) -> VecDeque<QueueEntry> {
        paths
            .iter()
            .map(|p| QueueEntry {
                path: PathBuf::from(p),
                mtime: Utc::now(),
            })
            .collect()
    }

    async fn run_to_completion(supervisor: &mut WorkerSupervisor) -> Vec<CompletedWorker> {
        let mut done = Vec::new();
        let end = Instant::now() + Duration::from_secs(20);
        while !supervisor.is_idle() && Instant::now() < end {
            done.extend(supervisor.poll());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        done
    }

    const REPORT: &str = r#"cat >/dev/null; echo '{"type":"loaded"}'; echo '{"type":"result","file":"x.toml","definitions":[],"import_errors":[]}'"#;

    #[tokio::test]
    async fn test_reported_result() {
        let mut supervisor = WorkerSupervisor::new(sh(REPORT), config(1, 5000, 10000));
        let mut q = queue(&["x.toml"]);
        let launched = supervisor.tick(&mut q);
        assert_eq!(launched.len(), 1);

        let done = run_to_completion(&mut supervisor).await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, WorkerOutcome::Reported);
        assert!(!done[0].result.has_errors());
        assert!(done[0].exit_status.is_some_and(|s| s.success()));
    }

    #[tokio::test]
    async fn test_crash_keeps_stderr_tail() {
        let script = "cat >/dev/null; echo 'boom: bad things' >&2; exit 3";
        let mut supervisor = WorkerSupervisor::new(sh(script), config(1, 5000, 10000));
        supervisor.tick(&mut queue(&["c.toml"]));

        let done = run_to_completion(&mut supervisor).await;
        assert_eq!(done[0].outcome, WorkerOutcome::Crashed);
        let error = &done[0].result.import_errors[0];
        assert_eq!(error.kind, crate::protocol::ImportErrorKind::Crash);
        assert!(error.traceback.as_deref().unwrap().contains("boom"));
        assert!(done[0].result.definitions.is_empty());
    }

    #[tokio::test]
    async fn test_load_timeout_kills_worker() {
        let mut supervisor = WorkerSupervisor::new(sh("sleep 30"), config(1, 200, 10000));
        supervisor.tick(&mut queue(&["slow.toml"]));

        let started = std::time::Instant::now();
        let done = run_to_completion(&mut supervisor).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(done[0].outcome, WorkerOutcome::TimedOut);
        assert!(done[0].result.timed_out());
        assert!(done[0].result.import_errors[0].message.contains("import timeout"));
        assert_eq!(done[0].result.import_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_loaded_marker_defers_to_file_timeout() {
        let script = r#"echo '{"type":"loaded"}'; sleep 30"#;
        let mut supervisor = WorkerSupervisor::new(sh(script), config(1, 200, 800));
        supervisor.tick(&mut queue(&["extract.toml"]));

        let done = run_to_completion(&mut supervisor).await;
        assert_eq!(done[0].outcome, WorkerOutcome::TimedOut);
        assert!(done[0].result.import_errors[0].message.contains("file processor timeout"));
        assert!(done[0].duration >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let mut supervisor = WorkerSupervisor::new(sh("cat >/dev/null; sleep 0.3"), config(2, 5000, 10000));
        let mut q = queue(&["1", "2", "3", "4", "5"]);

        let launched = supervisor.tick(&mut q);
        assert_eq!(launched.len(), 2);
        assert_eq!(supervisor.running(), 2);
        assert_eq!(q.len(), 3);

        // Full pool launches nothing more
        assert!(supervisor.tick(&mut q).is_empty());

        let mut total = 0;
        let end = Instant::now() + Duration::from_secs(20);
        while total < 5 && Instant::now() < end {
            total += supervisor.poll().len();
            supervisor.tick(&mut q);
            assert!(supervisor.running() <= 2);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_duplicate_file_is_skipped() {
        let mut supervisor = WorkerSupervisor::new(sh("sleep 0.3"), config(3, 5000, 10000));
        let mut q = queue(&["same.toml", "same.toml", "other.toml"]);

        let launched = supervisor.tick(&mut q);
        let paths: Vec<_> = launched.iter().map(|l| l.path.to_str().unwrap()).collect();
        assert_eq!(paths, vec!["same.toml", "other.toml"]);
        assert!(q.is_empty());
        supervisor.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_crash() {
        let command = WorkerCommand::new("/nonexistent/weft-worker", vec![]);
        let mut supervisor = WorkerSupervisor::new(command, config(1, 1000, 1000));
        supervisor.tick(&mut queue(&["a.toml"]));

        let done = supervisor.poll();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, WorkerOutcome::Crashed);
        assert!(done[0].result.import_errors[0].message.contains("Failed to start"));
    }

    #[tokio::test]
    async fn test_unencodable_path_is_crash() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut supervisor = WorkerSupervisor::new(sh(REPORT), config(1, 1000, 1000));
        let mut q = VecDeque::from([QueueEntry {
            path: PathBuf::from(OsStr::from_bytes(b"bad\xff.toml")),
            mtime: Utc::now(),
        }]);
        supervisor.tick(&mut q);
        assert_eq!(supervisor.running(), 0);

        let done = supervisor.poll();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, WorkerOutcome::Crashed);
        assert!(done[0].result.import_errors[0].message.contains("Cannot encode worker request"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_stragglers() {
        let mut supervisor = WorkerSupervisor::new(sh("sleep 30"), config(2, 60000, 60000));
        supervisor.tick(&mut queue(&["a", "b"]));

        let started = std::time::Instant::now();
        let done = supervisor.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|d| d.outcome == WorkerOutcome::Cancelled));
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_cancel_discards_result() {
        let mut supervisor = WorkerSupervisor::new(sh(REPORT), config(1, 5000, 10000));
        supervisor.tick(&mut queue(&["x.toml"]));
        assert!(supervisor.cancel(Path::new("x.toml")));
        assert!(!supervisor.cancel(Path::new("other.toml")));

        let done = run_to_completion(&mut supervisor).await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, WorkerOutcome::Cancelled);
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_cancel_slow_worker_frees_slot() {
        let mut supervisor = WorkerSupervisor::new(sh("sleep 30"), config(1, 60000, 60000));
        supervisor.tick(&mut queue(&["gone.toml"]));
        supervisor.cancel(Path::new("gone.toml"));

        let started = std::time::Instant::now();
        let done = run_to_completion(&mut supervisor).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(done[0].outcome, WorkerOutcome::Cancelled);
        assert!(supervisor.is_idle());
    }

    #[test]
    fn test_worker_command_from_argv() {
        assert!(WorkerCommand::from_argv(&[]).is_none());
        let cmd = WorkerCommand::from_argv(&["python3".into(), "-m".into(), "w".into()]).unwrap();
        assert_eq!(cmd.program(), Path::new("python3"));
    }
}
