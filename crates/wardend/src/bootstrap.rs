//! Daemon bootstrap orchestration.

use std::sync::Arc;

use ortho_config::OrthoError;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use warden_config::{Config, ConfigLoad, RuntimePaths, RuntimePathsError};

use crate::events::EventBus;
use crate::probe::{
    ControlClient, ControlError, Engine, ProbeManager, ProbeOptions, SingBoxEngine,
};
use crate::scheduler::{HookError, ScheduleHooks, Scheduler, SchedulerError, StartStatus};
use crate::store::{PipelineLog, Store, VerificationLog};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};
use crate::verify::{ControlApiMeasurer, Measurer, Verifier, VerifierOptions};

const BOOTSTRAP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::bootstrap");

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the daemon configuration.
    ///
    /// # Errors
    ///
    /// Returns the loader's error when a layer cannot be parsed.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader returning an already resolved configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps `config`.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Builds the probe engine and the measurer for a resolved configuration.
pub trait EngineProvider: Send + Sync {
    /// Engine the probe manager launches.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] when the engine cannot be prepared.
    fn engine(&self, config: &Config) -> Result<Arc<dyn Engine>, BootstrapError>;

    /// Measurer the verifier probes through.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] when the measurer cannot be prepared.
    fn measurer(&self, config: &Config) -> Result<Arc<dyn Measurer>, BootstrapError>;
}

/// Provider backed by the sing-box binary and its control API.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingBoxProvider;

impl SingBoxProvider {
    fn client(config: &Config) -> Result<ControlClient, BootstrapError> {
        ControlClient::new(config.request_timeout())
            .map_err(|source| BootstrapError::ControlClient { source })
    }
}

impl EngineProvider for SingBoxProvider {
    fn engine(&self, config: &Config) -> Result<Arc<dyn Engine>, BootstrapError> {
        let client = Self::client(config)?;
        Ok(Arc::new(SingBoxEngine::new(config.engine_binary().to_owned(), client)))
    }

    fn measurer(&self, config: &Config) -> Result<Arc<dyn Measurer>, BootstrapError> {
        Ok(Arc::new(ControlApiMeasurer::new(Self::client(config)?)))
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The probe work directory could not be prepared.
    #[error("failed to prepare runtime paths: {source}")]
    RuntimePaths {
        /// Underlying filesystem error.
        #[source]
        source: RuntimePathsError,
    },
    /// The control API client could not be built.
    #[error("failed to build control API client: {source}")]
    ControlClient {
        /// Underlying client error.
        #[source]
        source: ControlError,
    },
}

/// Scheduler callbacks backed by the verifier.
///
/// Subscription download and the pipeline belong to collaborators outside
/// this daemon; without them attached the refresh is a no-op and the
/// pipeline reports an empty run.
pub struct DaemonHooks {
    verifier: Arc<Verifier>,
}

impl DaemonHooks {
    /// Wraps the verifier.
    #[must_use]
    pub const fn new(verifier: Arc<Verifier>) -> Self {
        Self { verifier }
    }
}

impl ScheduleHooks for DaemonHooks {
    fn refresh_subscriptions(&self) -> Result<(), HookError> {
        debug!(target: BOOTSTRAP_TARGET, "no subscription source attached");
        Ok(())
    }

    fn subscriptions_updated(&self) -> Result<(), HookError> {
        Ok(())
    }

    fn verify(&self) -> Result<VerificationLog, HookError> {
        Ok(self.verifier.run()?)
    }

    fn pipeline(&self) -> Result<PipelineLog, HookError> {
        Ok(PipelineLog {
            started_at: OffsetDateTime::now_utc(),
            duration_ms: 0,
            copied: 0,
            skipped: 0,
            removed: 0,
            error: None,
        })
    }
}

/// The wired verification pipeline.
pub struct Daemon {
    config: Config,
    telemetry: TelemetryHandle,
    events: Arc<EventBus>,
    probe: Arc<ProbeManager>,
    verifier: Arc<Verifier>,
    scheduler: Scheduler,
}

impl Daemon {
    /// Accessor for the resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Accessor for the telemetry handle, primarily useful for testing.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Event bus observers subscribe to.
    #[must_use]
    pub const fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Probe process manager.
    #[must_use]
    pub const fn probe(&self) -> &Arc<ProbeManager> {
        &self.probe
    }

    /// Verification engine.
    #[must_use]
    pub const fn verifier(&self) -> &Arc<Verifier> {
        &self.verifier
    }

    /// Scheduler driving the periodic loops.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Starts the scheduler loops.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] when the scheduler cannot start.
    pub fn start(&self) -> Result<StartStatus, SchedulerError> {
        self.scheduler.start()
    }

    /// Restarts the scheduler so it picks up interval changes from the store.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] when the scheduler cannot start again.
    pub fn reload(&self) -> Result<StartStatus, SchedulerError> {
        info!(target: BOOTSTRAP_TARGET, "reloading scheduler settings");
        self.scheduler.restart()
    }

    /// Stops the scheduler, then the probe.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.probe.stop();
        info!(target: BOOTSTRAP_TARGET, "verification pipeline stopped");
    }
}

/// Bootstraps the daemon using the supplied collaborators.
///
/// # Errors
///
/// Returns [`BootstrapError`] when configuration, telemetry, the work
/// directory or the engine provider fail.
pub fn bootstrap_with<P>(
    loader: &dyn ConfigLoader,
    store: Arc<dyn Store>,
    provider: &P,
) -> Result<Daemon, BootstrapError>
where
    P: EngineProvider + ?Sized,
{
    let config = loader
        .load()
        .map_err(|source| BootstrapError::Configuration { source })?;
    let telemetry =
        telemetry::initialise(&config).map_err(|source| BootstrapError::Telemetry { source })?;
    let paths = RuntimePaths::from_config(&config)
        .map_err(|source| BootstrapError::RuntimePaths { source })?;

    let engine = provider.engine(&config)?;
    match engine.locate() {
        Ok(binary) => info!(
            target: BOOTSTRAP_TARGET,
            binary = %binary.display(),
            "probe engine located"
        ),
        Err(error) => warn!(
            target: BOOTSTRAP_TARGET,
            %error,
            "probe engine unavailable; verification will fail until it is installed"
        ),
    }

    let events = Arc::new(EventBus::new(config.event_buffer()));
    let probe = Arc::new(ProbeManager::new(
        engine,
        &paths,
        ProbeOptions::from_config(&config),
        Arc::clone(&events),
    ));
    let verifier = Arc::new(Verifier::new(
        Arc::clone(&store),
        Arc::clone(&probe),
        provider.measurer(&config)?,
        Arc::clone(&events),
        VerifierOptions::from_config(&config),
    ));
    let hooks = Arc::new(DaemonHooks::new(Arc::clone(&verifier)));
    let scheduler = Scheduler::new(store, hooks, Arc::clone(&events));

    info!(
        target: BOOTSTRAP_TARGET,
        work_dir = %paths.work_dir().display(),
        "daemon bootstrap completed"
    );
    Ok(Daemon {
        config,
        telemetry,
        events,
        probe,
        verifier,
        scheduler,
    })
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;
    use crate::store::MemoryStore;
    use crate::tests::support::{FakeEngine, ScriptedMeasurer};

    struct Provider {
        engine: Arc<FakeEngine>,
    }

    impl EngineProvider for Provider {
        fn engine(&self, _config: &Config) -> Result<Arc<dyn Engine>, BootstrapError> {
            let engine: Arc<dyn Engine> = self.engine.clone();
            Ok(engine)
        }

        fn measurer(&self, _config: &Config) -> Result<Arc<dyn Measurer>, BootstrapError> {
            Ok(Arc::new(ScriptedMeasurer::new()))
        }
    }

    fn config_in(dir: &TempDir) -> Config {
        let work_dir =
            Utf8PathBuf::from_path_buf(dir.path().join("probe")).expect("utf8 path");
        Config {
            work_dir: Some(work_dir),
            ..Config::default()
        }
    }

    #[test]
    fn bootstrap_tolerates_a_missing_engine() {
        let dir = TempDir::new().expect("temp dir");
        let provider = Provider {
            engine: Arc::new(FakeEngine::missing()),
        };
        let daemon = bootstrap_with(
            &StaticConfigLoader::new(config_in(&dir)),
            Arc::new(MemoryStore::new()),
            &provider,
        )
        .expect("bootstrap succeeds");

        assert!(dir.path().join("probe").is_dir());
        assert!(!daemon.probe().is_running());
        assert!(!daemon.scheduler().is_running());
    }

    #[test]
    fn shutdown_stops_the_scheduler() {
        let dir = TempDir::new().expect("temp dir");
        let provider = Provider {
            engine: Arc::new(FakeEngine::new()),
        };
        let daemon = bootstrap_with(
            &StaticConfigLoader::new(config_in(&dir)),
            Arc::new(MemoryStore::new()),
            &provider,
        )
        .expect("bootstrap succeeds");

        let status = daemon.start().expect("scheduler starts");
        assert!(matches!(status, StartStatus::Running { .. }));
        daemon.shutdown();

        assert!(!daemon.scheduler().is_running());
    }

    #[test]
    fn pipeline_without_a_collaborator_reports_an_empty_run() {
        let dir = TempDir::new().expect("temp dir");
        let provider = Provider {
            engine: Arc::new(FakeEngine::new()),
        };
        let daemon = bootstrap_with(
            &StaticConfigLoader::new(config_in(&dir)),
            Arc::new(MemoryStore::new()),
            &provider,
        )
        .expect("bootstrap succeeds");
        let hooks = DaemonHooks::new(Arc::clone(daemon.verifier()));

        hooks.refresh_subscriptions().expect("refresh is a no-op");
        let log = hooks.pipeline().expect("pipeline log");

        assert_eq!((log.copied, log.skipped, log.removed), (0, 0, 0));
        assert!(log.error.is_none());
    }
}
