//! Worker process supervision: spawn, monitor, restart or escalate.
//!
//! The supervisor re-executes the current binary once per configured worker,
//! with a marker environment variable that flips the child's role. Each
//! worker's stdout carries a single control line announcing the bound port;
//! its stderr (logging) is inherited. One monitor task per worker feeds
//! lifecycle events into a channel the supervisor drains strictly
//! sequentially, so record bookkeeping needs no locks.

use crate::config::Config;
use crate::role::{READY_LINE_PREFIX, WORKER_ENV};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Grace period between SIGTERM and SIGKILL while draining workers
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Lifecycle event reported by a worker's monitor task
#[derive(Debug)]
pub enum WorkerEvent {
    /// The worker bound its listening socket. Informational only.
    Listening { id: u32, pid: u32, port: u16 },
    /// The worker process exited
    Exited {
        id: u32,
        pid: u32,
        status: ExitStatus,
    },
}

/// Supervisor-side record of one live worker
#[derive(Debug)]
pub struct WorkerRecord {
    pub pid: u32,
    pub spawned_at: Instant,
}

/// Policy outcome for a worker exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitAction {
    /// Terminate the whole system with a non-zero status
    ForceShutdown,
    /// Spawn a replacement worker
    Restart,
    /// Keep running with reduced capacity
    Ignore,
}

/// `forceShutdownOnWorkerExit` takes precedence over the restart policy.
fn exit_action(config: &Config) -> ExitAction {
    if config.force_shutdown_on_worker_exit {
        ExitAction::ForceShutdown
    } else if config.restart_workers {
        ExitAction::Restart
    } else {
        ExitAction::Ignore
    }
}

/// Parse a worker's stdout control line into the bound port.
fn parse_ready_line(line: &str) -> Option<u16> {
    line.strip_prefix(READY_LINE_PREFIX)?.trim().parse().ok()
}

/// Owns the worker set. Only exists in the supervisor process, which never
/// binds the listening socket or serves a request itself.
pub struct WorkerSupervisor {
    config: Config,
    config_path: PathBuf,
    workers: HashMap<u32, WorkerRecord>,
    next_id: u32,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl WorkerSupervisor {
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            config_path,
            workers: HashMap::new(),
            next_id: 0,
            events_tx,
            events_rx,
        }
    }

    /// Spawn the configured number of workers, then supervise until a
    /// shutdown signal (clean exit) or a forced shutdown (error, exit 1).
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(cluster_size = self.config.cluster_size, "Spawning workers");
        for _ in 0..self.config.cluster_size {
            self.spawn_worker()?;
        }

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;

            loop {
                tokio::select! {
                    Some(event) = self.events_rx.recv() => {
                        self.handle_event(event).await?;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT, draining workers");
                        self.drain().await;
                        return Ok(());
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, draining workers");
                        self.drain().await;
                        return Ok(());
                    }
                }
            }
        }

        #[cfg(not(unix))]
        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, draining workers");
                    self.drain().await;
                    return Ok(());
                }
            }
        }
    }

    /// Apply the exit policy to one lifecycle event. Called only from the
    /// sequential event loop.
    async fn handle_event(&mut self, event: WorkerEvent) -> anyhow::Result<()> {
        match event {
            WorkerEvent::Listening { id, pid, port } => {
                info!(worker = id, pid, port, "Worker is listening");
            }
            WorkerEvent::Exited { id, pid, status } => {
                let code = status.code();
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                #[cfg(not(unix))]
                let signal: Option<i32> = None;
                warn!(worker = id, pid, ?code, ?signal, "Worker exited");

                self.workers.remove(&id);

                match exit_action(&self.config) {
                    ExitAction::ForceShutdown => {
                        error!(worker = id, pid, "Shutting down due to worker exit");
                        self.drain().await;
                        anyhow::bail!(
                            "worker #{} exited and forceShutdownOnWorkerExit is set",
                            pid
                        );
                    }
                    ExitAction::Restart => {
                        self.spawn_worker()?;
                    }
                    ExitAction::Ignore => {
                        info!(
                            remaining = self.workers.len(),
                            "Worker not replaced (restartWorkers is false)"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Fork one worker: the current executable, same config path, role
    /// marker set. A monitor task relays its control line and exit status.
    fn spawn_worker(&mut self) -> anyhow::Result<()> {
        let exe = std::env::current_exe()
            .map_err(|e| anyhow::anyhow!("Failed to locate current executable: {}", e))?;
        let id = self.next_id;
        self.next_id += 1;

        let mut cmd = Command::new(exe);
        cmd.arg("--config").arg(&self.config_path);
        cmd.env(WORKER_ENV, "1");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        info!(worker = id, pid, "Worker spawned");

        self.workers.insert(
            id,
            WorkerRecord {
                pid,
                spawned_at: Instant::now(),
            },
        );

        let stdout = child.stdout.take();
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match parse_ready_line(&line) {
                        Some(port) => {
                            let _ = events.send(WorkerEvent::Listening { id, pid, port });
                        }
                        None => {
                            debug!(worker = id, line = %line, "Worker output");
                        }
                    }
                }
            }

            match child.wait().await {
                Ok(status) => {
                    let _ = events.send(WorkerEvent::Exited { id, pid, status });
                }
                Err(e) => {
                    error!(worker = id, pid, error = %e, "Failed to wait for worker");
                }
            }
        });

        Ok(())
    }

    /// Signal every remaining worker to terminate, wait out the grace
    /// period, then SIGKILL stragglers.
    async fn drain(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        for (id, record) in &self.workers {
            info!(worker = *id, pid = record.pid, "Sending SIGTERM to worker");
            terminate(record.pid);
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE_PERIOD;
        while !self.workers.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.events_rx.recv()).await {
                Ok(Some(WorkerEvent::Exited { id, pid, .. })) => {
                    debug!(worker = id, pid, "Worker exited during drain");
                    self.workers.remove(&id);
                }
                Ok(Some(WorkerEvent::Listening { .. })) => {}
                Ok(None) | Err(_) => break,
            }
        }

        for (id, record) in &self.workers {
            warn!(
                worker = *id,
                pid = record.pid,
                "Grace period exceeded, sending SIGKILL"
            );
            kill(record.pid);
        }
        self.workers.clear();
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn kill(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

#[cfg(not(unix))]
fn kill(_pid: u32) {}
