//! The external proxy engine as seen by the probe manager.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use super::PROBE_TARGET;
use super::control::ControlClient;
use super::errors::ProbeError;
use super::validate::CheckError;

/// Operations the probe manager needs from the engine.
pub trait Engine: Send + Sync {
    /// Resolves the executable, failing when it is not installed.
    fn locate(&self) -> Result<PathBuf, ProbeError>;

    /// Runs a dry configuration check of `config`.
    fn check(&self, config: &Path) -> Result<(), CheckError>;

    /// Launches a long-lived instance against `config`, appending its output
    /// to `log`.
    fn spawn(&self, config: &Path, log: &Path) -> Result<Child, ProbeError>;

    /// Whether the control API of a launched instance answers.
    fn is_ready(&self, control_port: u16) -> bool;
}

impl<T: Engine + ?Sized> Engine for Arc<T> {
    fn locate(&self) -> Result<PathBuf, ProbeError> {
        self.as_ref().locate()
    }

    fn check(&self, config: &Path) -> Result<(), CheckError> {
        self.as_ref().check(config)
    }

    fn spawn(&self, config: &Path, log: &Path) -> Result<Child, ProbeError> {
        self.as_ref().spawn(config, log)
    }

    fn is_ready(&self, control_port: u16) -> bool {
        self.as_ref().is_ready(control_port)
    }
}

/// Engine driven through its `check -c` and `run -c` subcommands.
#[derive(Debug, Clone)]
pub struct SingBoxEngine {
    binary: Utf8PathBuf,
    control: ControlClient,
}

impl SingBoxEngine {
    /// Drives the engine found at `binary`, a path or a name on `PATH`.
    #[must_use]
    pub fn new(binary: impl Into<Utf8PathBuf>, control: ControlClient) -> Self {
        Self {
            binary: binary.into(),
            control,
        }
    }

    /// Configured binary.
    #[must_use]
    pub fn binary(&self) -> &Utf8Path {
        &self.binary
    }
}

impl Engine for SingBoxEngine {
    fn locate(&self) -> Result<PathBuf, ProbeError> {
        which::which(self.binary.as_std_path()).map_err(|source| ProbeError::BinaryNotFound {
            binary: self.binary.to_string(),
            source,
        })
    }

    fn check(&self, config: &Path) -> Result<(), CheckError> {
        let binary = self.locate().map_err(|error| CheckError::Unavailable {
            message: error.to_string(),
        })?;
        let output = Command::new(&binary)
            .arg("check")
            .arg("-c")
            .arg(config)
            .stdin(Stdio::null())
            .output()
            .map_err(|error| CheckError::Unavailable {
                message: format!("failed to run {}: {error}", binary.display()),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let mut combined = String::from_utf8_lossy(&output.stderr).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stdout));
        debug!(
            target: PROBE_TARGET,
            status = %output.status,
            output = %combined.trim(),
            "engine rejected probe configuration"
        );
        Err(CheckError::Rejected { output: combined })
    }

    fn spawn(&self, config: &Path, log: &Path) -> Result<Child, ProbeError> {
        let binary = self.locate()?;
        let log_error = |source: std::io::Error| ProbeError::LogOpen {
            path: log.to_path_buf(),
            source: Arc::new(source),
        };
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .map_err(log_error)?;
        let stderr = stdout.try_clone().map_err(log_error)?;
        Command::new(&binary)
            .arg("run")
            .arg("-c")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                binary,
                source: Arc::new(source),
            })
    }

    fn is_ready(&self, control_port: u16) -> bool {
        self.control.ping(control_port)
    }
}
