use thiserror::Error;

use crate::store::{PipelineLog, VerificationLog};
use crate::verify::VerifyError;

/// Failure reported by a scheduler callback.
#[derive(Debug, Error)]
pub enum HookError {
    /// The verification cycle failed.
    #[error(transparent)]
    Verify(#[from] VerifyError),
    /// Any other callback failure.
    #[error("{message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },
}

impl HookError {
    /// Builds a generic callback failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Callbacks the scheduler drives, registered by the orchestrator.
pub trait ScheduleHooks: Send + Sync {
    /// Re-downloads and stores every subscription.
    ///
    /// # Errors
    ///
    /// Returns [`HookError`] when the refresh fails.
    fn refresh_subscriptions(&self) -> Result<(), HookError>;

    /// Runs after a successful scheduled refresh.
    ///
    /// # Errors
    ///
    /// Returns [`HookError`] when downstream regeneration fails.
    fn subscriptions_updated(&self) -> Result<(), HookError>;

    /// Runs one verification cycle.
    ///
    /// # Errors
    ///
    /// Returns [`HookError`] when the cycle aborts.
    fn verify(&self) -> Result<VerificationLog, HookError>;

    /// Runs the auto-pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`HookError`] when the pipeline fails.
    fn pipeline(&self) -> Result<PipelineLog, HookError>;
}
