//! Engine double backed by `sleep` children.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::Value;

use crate::probe::{CheckError, Engine, ProbeError};

/// Engine that accepts every protocol but [`FakeEngine::REJECTED_PROTOCOL`]
/// and launches `sleep` in place of the real binary.
pub struct FakeEngine {
    present: bool,
    ready: AtomicBool,
    spawns: AtomicUsize,
    checks: AtomicUsize,
    pids: Mutex<Vec<u32>>,
}

impl FakeEngine {
    /// Protocol the fake check refuses.
    pub const REJECTED_PROTOCOL: &'static str = "unsupported";

    pub fn new() -> Self {
        Self {
            present: true,
            ready: AtomicBool::new(true),
            spawns: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
            pids: Mutex::new(Vec::new()),
        }
    }

    /// An engine whose control API never answers.
    pub fn never_ready() -> Self {
        let engine = Self::new();
        engine.ready.store(false, Ordering::SeqCst);
        engine
    }

    /// An engine that is not installed.
    pub fn missing() -> Self {
        Self {
            present: false,
            ..Self::new()
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    /// Kills every launched child, simulating a crash.
    pub fn kill_children(&self) {
        let pids = self.pids.lock().expect("pids lock").clone();
        for pid in pids {
            let raw = i32::try_from(pid).expect("pid fits");
            kill(Pid::from_raw(raw), Signal::SIGKILL).ok();
        }
    }
}

impl Engine for FakeEngine {
    fn locate(&self) -> Result<PathBuf, ProbeError> {
        if self.present {
            Ok(PathBuf::from("/usr/bin/sleep"))
        } else {
            Err(ProbeError::BinaryNotFound {
                binary: String::from("fake-engine"),
                source: which::Error::CannotFindBinaryPath,
            })
        }
    }

    fn check(&self, config: &Path) -> Result<(), CheckError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let text = fs::read_to_string(config).map_err(|error| CheckError::Unavailable {
            message: error.to_string(),
        })?;
        let document: Value = serde_json::from_str(&text).map_err(|error| {
            CheckError::Unavailable {
                message: error.to_string(),
            }
        })?;
        let outbounds = document["outbounds"].as_array().cloned().unwrap_or_default();
        for (position, outbound) in outbounds.iter().enumerate() {
            if outbound["type"] == Self::REJECTED_PROTOCOL {
                return Err(CheckError::Rejected {
                    output: format!(
                        "FATAL[0000] initialize outbound[{position}]: unknown outbound type: {}",
                        Self::REJECTED_PROTOCOL
                    ),
                });
            }
        }
        Ok(())
    }

    fn spawn(&self, config: &Path, log: &Path) -> Result<Child, ProbeError> {
        self.locate()?;
        assert!(config.exists(), "run configuration written before spawn");
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .map_err(|source| ProbeError::LogOpen {
                path: log.to_path_buf(),
                source: Arc::new(source),
            })?;
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(log_file)
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                binary: PathBuf::from("sleep"),
                source: Arc::new(source),
            })?;
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.pids.lock().expect("pids lock").push(child.id());
        Ok(child)
    }

    fn is_ready(&self, _control_port: u16) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
