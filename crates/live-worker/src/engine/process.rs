//! Driver that runs each channel in a dedicated worker process.
//!
//! The worker's piped stdin/stdout carry worker protocol frames. A reader task
//! per worker turns the `StartResult` frame into a
//! [`DriverEvent::WorkerReport`]; stop requests are written from detached
//! tasks so the pool loop never waits on a child. Liveness is polled with
//! `try_wait` from [`ChannelDriver::check_channels`].

use super::{
    ChannelDriver, ChannelFailure, ChannelStats, DriverEvent, DriverEventSink, DriverHandle,
    StartRequest, StopOutcome,
};
use crate::errors::{result_from_wire, ChannelError, ChannelResult, LwError};
use crate::observability::metrics;
use crate::pool::ChannelKey;
use crate::worker::{MODE_VAR, MODE_WORKER, READY_DELAY_VAR, TCP_PORT_VAR, UDP_PORT_VAR, URI_VAR};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use worker_protocol::{Frame, FrameReader, FrameWriter, StartResult, StopRequest};

/// How long a stopping worker may take to exit before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Program and extra arguments used to launch workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-launch the running executable in worker mode.
    ///
    /// # Errors
    ///
    /// Returns `LwError::Config` if the executable path cannot be resolved.
    pub fn current_exe() -> Result<Self, LwError> {
        let program = std::env::current_exe()
            .map_err(|e| LwError::Config(format!("cannot resolve current executable: {e}")))?;
        Ok(Self::new(program))
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    /// Waiting for the `StartResult` frame.
    Starting,
    /// Reported; the pool holds its completion.
    Running,
    /// Stop request sent; exit expected.
    Stopping { since: Instant },
}

#[derive(Debug)]
struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    state: WorkerState,
    killed: bool,
}

/// [`ChannelDriver`] with one worker process per channel.
#[derive(Debug)]
pub struct ProcessDriver {
    command: WorkerCommand,
    ready_delay: Duration,
    workers: HashMap<ChannelKey, WorkerProcess>,
}

impl ProcessDriver {
    /// `ready_delay` is forwarded to each worker's loopback engine.
    #[must_use]
    pub fn new(command: WorkerCommand, ready_delay: Duration) -> Self {
        Self {
            command,
            ready_delay,
            workers: HashMap::new(),
        }
    }

    /// Number of worker processes not yet reaped.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn spawn_worker(&self, request: &StartRequest) -> std::io::Result<Child> {
        Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(self.command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(MODE_VAR, MODE_WORKER)
            .env(URI_VAR, &request.uri)
            .env(TCP_PORT_VAR, request.hints.tcp.to_string())
            .env(UDP_PORT_VAR, request.hints.udp.to_string())
            .env(READY_DELAY_VAR, self.ready_delay.as_millis().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Forward the worker's `StartResult` onto the pool loop.
async fn read_reports(key: ChannelKey, stdout: ChildStdout, events: DriverEventSink) {
    let mut reader = FrameReader::new(stdout);
    loop {
        match reader.next_frame().await {
            Ok(Some(Frame::StartResult(report))) => {
                debug!(target: "lw.driver.process", channel = %key, code = report.error_code, "Worker reported");
                if !events.post(DriverEvent::WorkerReport { key, report }) {
                    return;
                }
            }
            Ok(Some(other)) => {
                warn!(target: "lw.driver.process", channel = %key, kind = ?other.kind(), "Unexpected frame from worker");
            }
            Ok(None) => {
                debug!(target: "lw.driver.process", channel = %key, "Worker closed its output");
                return;
            }
            Err(e) => {
                warn!(target: "lw.driver.process", channel = %key, error = %e, "Worker output unreadable");
                let report = StartResult::failed(ChannelError::EngineFailure.code());
                events.post(DriverEvent::WorkerReport { key, report });
                return;
            }
        }
    }
}

/// Send the stop request and close the worker's stdin.
async fn send_stop(key: ChannelKey, stdin: ChildStdin) {
    let mut writer = FrameWriter::new(stdin);
    let stop = Frame::StopRequest(StopRequest::new(0, "channel released"));
    if let Err(e) = writer.send(&stop).await {
        // Worker already gone; the reaper will notice
        debug!(target: "lw.driver.process", channel = %key, error = %e, "Stop request not delivered");
        return;
    }
    let _ = writer.close().await;
}

impl ChannelDriver for ProcessDriver {
    fn name(&self) -> &'static str {
        "process"
    }

    fn start(&mut self, request: &StartRequest, events: &DriverEventSink) -> Option<DriverHandle> {
        let key = request.key;
        let mut child = match self.spawn_worker(request) {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    target: "lw.driver.process",
                    channel = %key,
                    program = %self.command.program.display(),
                    error = %e,
                    "Failed to spawn worker"
                );
                return None;
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            warn!(target: "lw.driver.process", channel = %key, "Worker spawned without pipes");
            let _ = child.start_kill();
            return None;
        };

        info!(
            target: "lw.driver.process",
            channel = %key,
            pid = child.id(),
            "Worker spawned"
        );
        tokio::spawn(read_reports(key, stdout, events.clone()));

        self.workers.insert(
            key,
            WorkerProcess {
                child,
                stdin: Some(stdin),
                state: WorkerState::Starting,
                killed: false,
            },
        );
        Some(DriverHandle::new(key))
    }

    fn stop(&mut self, handle: DriverHandle, events: &DriverEventSink) -> StopOutcome {
        let key = handle.key();
        let Some(worker) = self.workers.get_mut(&key) else {
            // Already reaped
            return StopOutcome::Released;
        };

        let previous = worker.state;
        if matches!(previous, WorkerState::Stopping { .. }) {
            return StopOutcome::Released;
        }
        worker.state = WorkerState::Stopping {
            since: Instant::now(),
        };
        if let Some(stdin) = worker.stdin.take() {
            tokio::spawn(send_stop(key, stdin));
        }
        debug!(target: "lw.driver.process", channel = %key, pid = worker.child.id(), "Worker stopping");

        if previous == WorkerState::Starting {
            events.post(DriverEvent::Finished {
                key,
                result: Err(ChannelError::Aborted),
            });
            StopOutcome::CompletionPending
        } else {
            StopOutcome::Released
        }
    }

    fn resolve(&mut self, event: DriverEvent) -> Option<(ChannelKey, ChannelResult)> {
        match event {
            DriverEvent::WorkerReport { key, report } => {
                // Reports from stopping or reaped workers were superseded
                let worker = self.workers.get_mut(&key)?;
                if worker.state != WorkerState::Starting {
                    return None;
                }
                worker.state = WorkerState::Running;
                Some((key, result_from_wire(report.error_code, report.url)))
            }
            DriverEvent::Finished { key, result } => Some((key, result)),
            DriverEvent::EngineSignal { key, .. } => {
                warn!(target: "lw.driver.process", channel = %key, "Unexpected engine signal");
                None
            }
        }
    }

    fn check_channels(&mut self, failures: &mut Vec<ChannelFailure>) {
        let now = Instant::now();
        let mut reaped = Vec::new();

        for (key, worker) in &mut self.workers {
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    reaped.push(*key);
                    if let WorkerState::Stopping { .. } = worker.state {
                        debug!(target: "lw.driver.process", channel = %key, %status, "Worker reaped");
                    } else {
                        warn!(target: "lw.driver.process", channel = %key, %status, "Worker exited unexpectedly");
                        metrics::record_worker_death();
                        failures.push(ChannelFailure {
                            key: *key,
                            error: ChannelError::ProcessDied,
                        });
                    }
                }
                Ok(None) => {
                    if let WorkerState::Stopping { since } = worker.state {
                        if !worker.killed && now.duration_since(since) >= STOP_GRACE {
                            warn!(target: "lw.driver.process", channel = %key, "Worker ignored stop request, killing");
                            let _ = worker.child.start_kill();
                            worker.killed = true;
                        }
                    }
                }
                Err(e) => {
                    warn!(target: "lw.driver.process", channel = %key, error = %e, "Worker status unavailable");
                    reaped.push(*key);
                    if !matches!(worker.state, WorkerState::Stopping { .. }) {
                        failures.push(ChannelFailure {
                            key: *key,
                            error: ChannelError::ProcessDied,
                        });
                    }
                }
            }
        }

        for key in reaped {
            self.workers.remove(&key);
        }
    }

    fn status(&self, _handle: &DriverHandle) -> Option<ChannelStats> {
        // Engine statistics live in the worker
        None
    }

    fn shutdown(&mut self) {
        for (key, mut worker) in self.workers.drain() {
            if let Err(e) = worker.child.start_kill() {
                debug!(target: "lw.driver.process", channel = %key, error = %e, "Worker already exited");
            }
        }
    }
}
