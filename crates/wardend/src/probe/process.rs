//! Scoped handle over one running engine process.

use std::path::Path;
use std::process::Child;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tempfile::TempPath;
use tracing::{debug, warn};

use super::PROBE_TARGET;
use super::errors::ProbeError;

/// Wait after SIGKILL before giving up on reaping.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Grace period used when a handle is dropped without an explicit stop.
const DROP_GRACE: Duration = Duration::from_secs(1);

/// A running engine process and its temporary configuration.
///
/// A monitor thread owns the child and reaps it. Stopping the handle, or
/// dropping it, terminates the process and removes the configuration file.
pub(crate) struct ProbeProcess {
    pid: u32,
    exit: Receiver<String>,
    exit_status: Option<String>,
    config: Option<TempPath>,
}

impl ProbeProcess {
    /// Starts monitoring `child`. `on_exit` runs on the monitor thread after
    /// the process has been reaped, whatever the cause of the exit.
    pub(crate) fn watch<F>(child: Child, config: TempPath, on_exit: F) -> Result<Self, ProbeError>
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let pid = child.id();
        let (sender, exit) = mpsc::channel();
        let monitor = move || {
            let mut child = child;
            let status = child
                .wait()
                .map_or_else(|error| format!("wait failed: {error}"), |status| status.to_string());
            debug!(target: PROBE_TARGET, pid, %status, "probe process exited");
            if sender.send(status.clone()).is_err() {
                debug!(target: PROBE_TARGET, pid, "probe handle already released");
            }
            on_exit(&status);
        };
        let spawned = thread::Builder::new()
            .name(format!("probe-monitor-{pid}"))
            .spawn(monitor);
        match spawned {
            Ok(_) => Ok(Self {
                pid,
                exit,
                exit_status: None,
                config: Some(config),
            }),
            Err(source) => {
                // The closure, and the child inside it, were dropped unreaped.
                send_signal(pid, Signal::SIGKILL);
                Err(ProbeError::Monitor {
                    source: Arc::new(source),
                })
            }
        }
    }

    pub(crate) const fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    /// Exit status, if the process has already exited.
    pub(crate) fn exit_status(&mut self) -> Option<&str> {
        if self.exit_status.is_none() {
            match self.exit.try_recv() {
                Ok(status) => self.exit_status = Some(status),
                Err(TryRecvError::Disconnected) => {
                    self.exit_status = Some(String::from("monitor stopped"));
                }
                Err(TryRecvError::Empty) => {}
            }
        }
        self.exit_status.as_deref()
    }

    /// Terminates the process and removes its configuration. Idempotent.
    ///
    /// Sends SIGTERM, waits up to `grace`, then sends SIGKILL.
    pub(crate) fn stop(&mut self, grace: Duration) {
        if self.exit_status().is_none() {
            send_signal(self.pid, Signal::SIGTERM);
            if !self.await_exit(grace) {
                warn!(
                    target: PROBE_TARGET,
                    pid = self.pid,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "probe ignored SIGTERM; killing"
                );
                send_signal(self.pid, Signal::SIGKILL);
                if !self.await_exit(KILL_WAIT) {
                    warn!(
                        target: PROBE_TARGET,
                        pid = self.pid,
                        "probe did not exit after SIGKILL"
                    );
                }
            }
        }
        if let Some(config) = self.config.take() {
            let path = config.to_path_buf();
            if let Err(error) = config.close() {
                warn!(
                    target: PROBE_TARGET,
                    path = %path.display(),
                    %error,
                    "failed to remove probe configuration"
                );
            }
        }
    }

    fn await_exit(&mut self, timeout: Duration) -> bool {
        match self.exit.recv_timeout(timeout) {
            Ok(status) => {
                self.exit_status = Some(status);
                true
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.exit_status = Some(String::from("monitor stopped"));
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

impl Drop for ProbeProcess {
    fn drop(&mut self) {
        self.stop(DROP_GRACE);
    }
}

fn send_signal(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => {
            warn!(
                target: PROBE_TARGET,
                pid,
                signal = signal.as_str(),
                %errno,
                "failed to signal probe"
            );
        }
    }
}
