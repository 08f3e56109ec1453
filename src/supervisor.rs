use crate::config::{Config, Health};
use crate::discovery;
use crate::error::{CrashReason, OcrError, Result};
use crate::util::now_rfc3339;
use futures::future::Either;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where the worker is listening. Built exactly once per session, when the
/// health probe first succeeds; never handed out before that.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    pub host: String,
    pub port: u16,
    pub ready_since: String,
}

impl WorkerEndpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Ready,
    /// Running and was healthy, but has since logged an error-severity line.
    Degraded,
    Terminating,
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
enum StopMode {
    Graceful,
    Force,
}

/// Owns exactly one worker process at a time. All lifecycle state lives on
/// the instance, so independent sessions can run side by side in tests.
///
/// There is no automatic restart: a post-ready crash lands in
/// `Failed(reason)` on the state watch and stays there until the caller
/// decides to `start()` again.
pub struct Supervisor {
    cfg: Config,
    workdir: PathBuf,
    state_tx: Arc<watch::Sender<WorkerState>>,
    state_rx: watch::Receiver<WorkerState>,
    endpoint: Option<WorkerEndpoint>,
    pid: Option<u32>,
    stop_tx: Option<mpsc::Sender<StopMode>>,
    monitor: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(cfg: &Config) -> Self {
        let (state_tx, state_rx) = watch::channel(WorkerState::Stopped);
        Self {
            cfg: cfg.clone(),
            workdir: PathBuf::from(&cfg.worker.workdir),
            state_tx: Arc::new(state_tx),
            state_rx,
            endpoint: None,
            pid: None,
            stop_tx: None,
            monitor: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state_rx.clone()
    }

    /// The endpoint is only available once the worker reached Ready, and is
    /// cleared again on stop.
    pub fn endpoint(&self) -> Option<&WorkerEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Launch the worker and wait for it to become healthy.
    ///
    /// Resolves to exactly one terminal outcome. Three completion sources
    /// race: process exit, a fatal stderr line, and health success; the
    /// select below makes the first one win deterministically (exit beats
    /// log line beats health when they arrive together).
    pub async fn start(&mut self) -> Result<WorkerEndpoint> {
        self.start_inner(None).await
    }

    /// Like `start`, but gives up when `cancel` flips to true (host
    /// termination). The already-spawned worker is torn down through the
    /// normal signal-then-kill path before the error is returned.
    pub async fn start_cancellable(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<WorkerEndpoint> {
        self.start_inner(Some(cancel)).await
    }

    async fn start_inner(
        &mut self,
        cancel: Option<&mut watch::Receiver<bool>>,
    ) -> Result<WorkerEndpoint> {
        if self.monitor.is_some() {
            return Err(OcrError::WorkerSpawnFailure(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a worker is already running under this supervisor",
            )));
        }

        self.state_tx.send_replace(WorkerState::Starting);
        discovery::remove_stale_handshake(&self.cfg.discovery, &self.workdir);

        info!(
            command = %self.cfg.worker.command,
            workdir = %self.workdir.display(),
            "starting worker"
        );

        let mut child = match Command::new(&self.cfg.worker.command)
            .args(&self.cfg.worker.args)
            .current_dir(&self.workdir)
            .envs(&self.cfg.worker.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.state_tx
                    .send_replace(WorkerState::Failed(format!("spawn: {e}")));
                return Err(OcrError::WorkerSpawnFailure(e));
            }
        };

        self.pid = child.id();
        debug!(pid = ?self.pid, "worker spawned");

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(8);
        wire_log_sinks(&mut child, fatal_tx, self.cfg.debug.log_worker_output);

        let discovery_cfg = self.cfg.discovery.clone();
        let health_cfg = self.cfg.health.clone();
        let host = self.cfg.endpoints.host.clone();
        let workdir = self.workdir.clone();
        let readiness = async move {
            let port = discovery::resolve_port(&discovery_cfg, &workdir).await;
            let url = format!("http://{}:{}{}", host, port, health_cfg.path);
            if wait_healthy(&health_cfg, &url).await {
                Some(port)
            } else {
                None
            }
        };
        tokio::pin!(readiness);

        let cancel_wait = match cancel {
            Some(rx) => Either::Left(async move {
                // A closed channel means cancellation can no longer arrive.
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }),
            None => Either::Right(std::future::pending::<()>()),
        };
        tokio::pin!(cancel_wait);

        let mut fatal_open = true;
        let outcome: std::result::Result<u16, OcrError> = loop {
            tokio::select! {
                biased;
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    break Err(OcrError::WorkerCrashedBeforeReady {
                        reason: CrashReason::Exit(code),
                    });
                }
                line = fatal_rx.recv(), if fatal_open => match line {
                    Some(line) => break Err(OcrError::WorkerCrashedBeforeReady {
                        reason: CrashReason::LogLine(line),
                    }),
                    None => fatal_open = false,
                },
                healthy = &mut readiness => break match healthy {
                    Some(port) => Ok(port),
                    None => Err(OcrError::HealthCheckTimeout {
                        timeout_secs: self.cfg.health.timeout_seconds,
                    }),
                },
                _ = &mut cancel_wait => break Err(OcrError::StartupCancelled),
            }
        };

        let port = match outcome {
            Ok(port) => port,
            Err(err) => {
                // The process may still be alive (health timeout, fatal log
                // line, cancellation). Tear it down before reporting.
                terminate_child(&mut child, Duration::from_millis(self.cfg.shutdown.grace_ms))
                    .await;
                self.pid = None;
                let state = if matches!(err, OcrError::StartupCancelled) {
                    WorkerState::Stopped
                } else {
                    WorkerState::Failed(err.to_string())
                };
                self.state_tx.send_replace(state);
                return Err(err);
            }
        };

        let endpoint = WorkerEndpoint {
            host: self.cfg.endpoints.host.clone(),
            port,
            ready_since: now_rfc3339(),
        };
        info!(port, "worker is ready");
        self.state_tx.send_replace(WorkerState::Ready);
        self.endpoint = Some(endpoint.clone());

        let (stop_tx, stop_rx) = mpsc::channel::<StopMode>(2);
        self.stop_tx = Some(stop_tx);
        self.monitor = Some(tokio::spawn(monitor(
            child,
            fatal_rx,
            stop_rx,
            Arc::clone(&self.state_tx),
            Duration::from_millis(self.cfg.shutdown.grace_ms),
        )));

        Ok(endpoint)
    }

    /// Graceful shutdown: termination signal, then a forced kill if the
    /// worker outlives the grace period. No-op when nothing is running;
    /// repeated calls collapse to one teardown.
    pub async fn stop(&mut self) {
        self.shutdown(StopMode::Graceful).await;
    }

    /// Immediate forced kill, skipping the grace period.
    pub async fn force_stop(&mut self) {
        self.shutdown(StopMode::Force).await;
    }

    async fn shutdown(&mut self, mode: StopMode) {
        self.endpoint = None;
        if let Some(tx) = self.stop_tx.take() {
            // A closed channel means the monitor already observed the exit.
            let _ = tx.send(mode).await;
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.await;
        }
        self.pid = None;
    }
}

/// Attach the two log-classification sinks. Worker stdout is re-logged at
/// info; stderr lines carrying a severity marker go to `fatal_tx` (and the
/// error log), the rest to warn.
fn wire_log_sinks(child: &mut Child, fatal_tx: mpsc::Sender<String>, log_output: bool) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if log_output {
                    info!(target: "worker", "{line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if is_fatal_line(&line) {
                    error!(target: "worker", "{line}");
                    let _ = fatal_tx.send(line).await;
                } else if log_output {
                    warn!(target: "worker", "{line}");
                }
            }
        });
    }
}

fn is_fatal_line(line: &str) -> bool {
    line.contains("ERROR") || line.contains("CRITICAL") || line.contains("FATAL")
}

/// Poll the health endpoint until it answers 200, after an initial settle
/// delay. Only HTTP 200 counts; any other status or connection failure is
/// "not ready yet". The overall deadline covers probe time as well, so a
/// stalled endpoint cannot stretch the wait past `timeout_seconds`.
async fn wait_healthy(cfg: &Health, url: &str) -> bool {
    tokio::time::sleep(Duration::from_millis(cfg.settle_delay_ms)).await;

    let interval = Duration::from_millis(cfg.poll_interval_ms.max(1));
    let client = match reqwest::Client::builder().timeout(interval).build() {
        Ok(client) => client,
        Err(e) => {
            error!("could not build health probe client: {e}");
            return false;
        }
    };

    let poll = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match client.get(url).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => return,
                Ok(resp) => {
                    debug!(attempt, status = %resp.status(), "health probe not ready");
                }
                Err(e) => {
                    debug!(attempt, "health probe failed: {e}");
                }
            }
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(cfg.timeout_seconds), poll)
        .await
        .is_ok()
}

/// Post-ready watch over the child. Fatal stderr lines degrade the state;
/// an unexpected exit moves to Failed/Stopped; a stop command runs the
/// graceful-then-forced teardown.
async fn monitor(
    mut child: Child,
    mut fatal_rx: mpsc::Receiver<String>,
    mut stop_rx: mpsc::Receiver<StopMode>,
    state: Arc<watch::Sender<WorkerState>>,
    grace: Duration,
) {
    let mut fatal_open = true;
    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(s) if s.success() => {
                        info!("worker exited cleanly");
                        state.send_replace(WorkerState::Stopped);
                    }
                    Ok(s) => {
                        error!("worker exited after ready: {s}");
                        state.send_replace(WorkerState::Failed(format!(
                            "exited after ready: {s}"
                        )));
                    }
                    Err(e) => {
                        error!("could not observe worker exit: {e}");
                        state.send_replace(WorkerState::Failed(e.to_string()));
                    }
                }
                return;
            }
            line = fatal_rx.recv(), if fatal_open => match line {
                Some(log_line) => {
                    error!("{}", OcrError::WorkerDegraded { log_line });
                    state.send_replace(WorkerState::Degraded);
                }
                None => fatal_open = false,
            },
            cmd = stop_rx.recv() => {
                let mode = cmd.unwrap_or(StopMode::Force);
                state.send_replace(WorkerState::Terminating);
                match mode {
                    StopMode::Graceful => terminate_child(&mut child, grace).await,
                    StopMode::Force => force_kill(&mut child).await,
                }
                state.send_replace(WorkerState::Stopped);
                return;
            }
        }
    }
}

/// Graceful termination signal, then a forced kill once the grace period
/// elapses. Always returns with the child reaped.
async fn terminate_child(child: &mut Child, grace: Duration) {
    if send_terminate(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {
                debug!("worker exited within the grace period");
                return;
            }
            Err(_) => warn!("worker ignored termination signal; killing"),
        }
    }
    force_kill(child).await;
}

async fn force_kill(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(unix)]
fn send_terminate(child: &Child) -> bool {
    // `id()` is None once the exit has been observed; never signal a pid the
    // kernel may have recycled.
    match child.id() {
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) -> bool {
    // No graceful signal on this platform; the caller falls through to kill.
    false
}
