//! Derives runtime artefact paths for the probe process.
//!
//! The work directory houses the temporary probe configuration files and the
//! log sink that captures the probe engine's stdout and stderr. It is created
//! on demand with owner-only permissions on Unix.

use std::fs::DirBuilder;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;
use crate::defaults::default_work_dir;

/// Name of the file receiving the probe engine's output.
const PROBE_LOG_FILE: &str = "probe.log";

/// Canonical paths for runtime artefacts written by the daemon.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    work_dir: PathBuf,
    probe_log_path: PathBuf,
}

impl RuntimePaths {
    /// Derives runtime paths from the shared configuration, creating the work
    /// directory when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimePathsError::WorkDirectory`] when the directory cannot
    /// be created.
    pub fn from_config(config: &Config) -> Result<Self, RuntimePathsError> {
        let work_dir = config
            .work_dir()
            .map_or_else(default_work_dir, ToOwned::to_owned)
            .into_std_path_buf();
        Self::in_directory(work_dir)
    }

    /// Builds runtime paths rooted at an explicit directory.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimePathsError::WorkDirectory`] when the directory cannot
    /// be created.
    pub fn in_directory(work_dir: impl Into<PathBuf>) -> Result<Self, RuntimePathsError> {
        let work_dir = work_dir.into();
        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(&work_dir)
            .map_err(|source| RuntimePathsError::WorkDirectory {
                path: work_dir.clone(),
                source,
            })?;
        Ok(Self {
            probe_log_path: work_dir.join(PROBE_LOG_FILE),
            work_dir,
        })
    }

    /// Directory holding runtime artefacts.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        self.work_dir.as_path()
    }

    /// Path of the probe engine log sink.
    #[must_use]
    pub fn probe_log_path(&self) -> &Path {
        self.probe_log_path.as_path()
    }
}

/// Errors raised while deriving daemon runtime paths.
#[derive(Debug, Error)]
pub enum RuntimePathsError {
    /// Creating the work directory failed.
    #[error("failed to prepare work directory '{path}': {source}")]
    WorkDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn derives_paths_under_configured_directory() {
        let temp = TempDir::new().expect("temp dir");
        let nested = temp.path().join("nested").join("warden");
        let config = Config {
            work_dir: Some(Utf8PathBuf::from_path_buf(nested.clone()).expect("utf8 path")),
            ..Config::default()
        };

        let paths = RuntimePaths::from_config(&config).expect("paths should derive");

        assert_eq!(paths.work_dir(), nested.as_path());
        assert!(paths.work_dir().is_dir(), "work dir should be created");
        assert!(paths.probe_log_path().ends_with("probe.log"));
    }

    #[test]
    fn default_directory_is_namespaced_for_warden() {
        let tail = default_work_dir();
        let has_warden = tail.components().any(|part| part.as_str() == "warden");
        assert!(has_warden, "unexpected default work dir: {tail}");
    }

    #[test]
    fn reports_uncreatable_directory() {
        let temp = TempDir::new().expect("temp dir");
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, b"x").expect("write blocker");

        let error = RuntimePaths::in_directory(blocker.join("child"))
            .expect_err("directory below a file cannot be created");
        assert!(matches!(error, RuntimePathsError::WorkDirectory { .. }));
    }
}
