use crate::config::Discovery;
use crate::error::OcrError;
use crate::retry::retry_fixed;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Resolve the worker's listening port from its handshake file.
///
/// Polls the file up to `max_attempts` times at a fixed interval. A file whose
/// contents do not yet parse as a decimal port counts as absent (the worker
/// may still be writing it). On exhaustion the documented fallback port is
/// returned instead of an error, so the caller can still attempt a connection
/// and fail there with a clearer message. Idempotent; safe to call once per
/// supervisor session.
pub async fn resolve_port(cfg: &Discovery, workdir: &Path) -> u16 {
    let path = handshake_path(cfg, workdir);
    let interval = Duration::from_millis(cfg.poll_interval_ms);

    let found = retry_fixed(cfg.max_attempts, interval, |attempt| {
        let path = path.clone();
        async move {
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => match raw.trim().parse::<u16>() {
                    Ok(port) => Some(port),
                    Err(_) => {
                        debug!(attempt, "handshake file present but not yet parseable");
                        None
                    }
                },
                Err(_) => {
                    debug!(attempt, "handshake file absent");
                    None
                }
            }
        }
    })
    .await;

    match found {
        Some(port) => {
            debug!(port, file = %path.display(), "resolved worker port");
            port
        }
        None => {
            warn!(
                "{}; falling back to port {}",
                OcrError::PortDiscoveryTimeout {
                    attempts: cfg.max_attempts
                },
                cfg.fallback_port
            );
            cfg.fallback_port
        }
    }
}

pub fn handshake_path(cfg: &Discovery, workdir: &Path) -> PathBuf {
    workdir.join(&cfg.port_file)
}

/// Delete a handshake file left over from a previous session, so discovery
/// cannot observe last session's port.
pub fn remove_stale_handshake(cfg: &Discovery, workdir: &Path) {
    if !cfg.remove_stale_file {
        return;
    }
    let path = handshake_path(cfg, workdir);
    match std::fs::remove_file(&path) {
        Ok(()) => debug!(file = %path.display(), "removed stale handshake file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), "could not remove stale handshake file: {e}"),
    }
}
