//! Child side of process isolation.
//!
//! A worker process runs exactly one channel. The pool starts it with the
//! request in `LIVE_WORKER_*` environment variables and talks to it over
//! stdin/stdout using worker protocol frames:
//!
//! 1. Start the local engine and wait for its readiness callback.
//! 2. Send one `StartResult` frame.
//! 3. Wait for a `StopRequest` (or stdin EOF, meaning the parent is gone).
//! 4. Release the engine handle and return.
//!
//! A stop that arrives before readiness skips step 2. The worker never exits
//! on its own before step 3, so an exit the parent did not ask for is always
//! a crash.

use crate::config::{ConfigError, DEFAULT_ENGINE_READY_DELAY_MS};
use crate::engine::NativeEngine;
use crate::errors::{ChannelError, LwError};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use worker_protocol::{Frame, FrameReader, FrameWriter, StartResult};

/// Selects worker mode in the `live-worker` binary.
pub const MODE_VAR: &str = "LIVE_WORKER_MODE";

/// Value of [`MODE_VAR`] for worker processes.
pub const MODE_WORKER: &str = "worker";

pub const URI_VAR: &str = "LIVE_WORKER_URI";
pub const TCP_PORT_VAR: &str = "LIVE_WORKER_TCP_PORT";
pub const UDP_PORT_VAR: &str = "LIVE_WORKER_UDP_PORT";
pub const READY_DELAY_VAR: &str = "LIVE_WORKER_READY_DELAY_MS";

/// Request passed to a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub uri: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub ready_delay: Duration,
}

fn parse_port(vars: &HashMap<String, String>, name: &str) -> Result<u16, ConfigError> {
    vars.get(name).map_or(Ok(0), |raw| {
        raw.trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}='{raw}' is not a valid port")))
    })
}

impl WorkerArgs {
    /// Load worker arguments from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the URI is missing or a number is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load worker arguments from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the URI is missing or a number is invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let uri = vars
            .get(URI_VAR)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnvVar(URI_VAR.to_string()))?;

        let ready_delay_ms = match vars.get(READY_DELAY_VAR) {
            None => DEFAULT_ENGINE_READY_DELAY_MS,
            Some(raw) => raw.trim().parse().map_err(|_| {
                ConfigError::InvalidValue(format!("{READY_DELAY_VAR}='{raw}' is not a valid number"))
            })?,
        };

        Ok(Self {
            uri,
            tcp_port: parse_port(vars, TCP_PORT_VAR)?,
            udp_port: parse_port(vars, UDP_PORT_VAR)?,
            ready_delay: Duration::from_millis(ready_delay_ms),
        })
    }
}

/// Read frames until a stop request or end of stream.
async fn wait_for_stop<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<(), LwError> {
    loop {
        match reader.next_frame().await? {
            Some(Frame::StopRequest(stop)) => {
                info!(
                    target: "lw.worker",
                    code = stop.error_code,
                    message = %stop.message,
                    "Stop requested"
                );
                return Ok(());
            }
            Some(other) => {
                warn!(target: "lw.worker", kind = ?other.kind(), "Ignoring unexpected frame");
            }
            None => {
                info!(target: "lw.worker", "Parent closed the control stream");
                return Ok(());
            }
        }
    }
}

/// Run one channel to completion over the given control stream.
///
/// # Errors
///
/// Returns `LwError::Io` or `LwError::Protocol` if the control stream fails.
/// The engine handle is released in every case.
pub async fn run_worker<E, R, W>(
    mut engine: E,
    args: &WorkerArgs,
    input: R,
    output: W,
) -> Result<(), LwError>
where
    E: NativeEngine,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(input);
    let mut writer = FrameWriter::new(output);

    let Some(handle) = engine.start(&args.uri, args.tcp_port, args.udp_port) else {
        warn!(
            target: "lw.worker",
            tcp_port = args.tcp_port,
            udp_port = args.udp_port,
            "Engine refused to start channel"
        );
        let report = StartResult::failed(ChannelError::EngineUnavailable.code());
        writer.send(&Frame::StartResult(report)).await?;
        return wait_for_stop(&mut reader).await;
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    engine.set_completion_callback(
        handle,
        Box::new(move |ready| {
            let _ = ready_tx.send(ready);
        }),
    );
    debug!(target: "lw.worker", handle = handle.0, "Waiting for engine readiness");

    tokio::select! {
        ready = ready_rx => {
            let report = match ready {
                Ok(true) => engine.get_status(handle).map_or_else(
                    || StartResult::failed(ChannelError::EngineFailure.code()),
                    |stats| StartResult::ready(stats.playback_url()),
                ),
                Ok(false) | Err(_) => StartResult::failed(ChannelError::EngineFailure.code()),
            };
            info!(target: "lw.worker", code = report.error_code, url = %report.url, "Engine reported");

            if let Err(e) = writer.send(&Frame::StartResult(report)).await {
                engine.stop(handle);
                return Err(e.into());
            }
        }
        stopped = wait_for_stop(&mut reader) => {
            info!(target: "lw.worker", "Stopped before engine became ready");
            engine.stop(handle);
            return stopped;
        }
    }

    let stopped = wait_for_stop(&mut reader).await;
    engine.stop(handle);
    stopped
}
