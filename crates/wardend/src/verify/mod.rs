//! Verification cycles and node lifecycle transitions.

mod cycle;
mod errors;
mod lifecycle;
mod measure;

pub use cycle::{Verifier, VerifierOptions};
pub use errors::VerifyError;
pub use lifecycle::{Evaluation, Transition, evaluate};
pub use measure::{ControlApiMeasurer, MeasureError, Measurer};

#[cfg(test)]
pub(crate) use measure::MockMeasurer;

pub(crate) const VERIFY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::verify");
