//! Isolated engine instance used to measure candidate nodes.
//!
//! The probe is a throwaway engine process, separate from any production
//! proxy, loaded with a minimal configuration: one outbound per node, an
//! auto-selecting group over all of them, and a selector that the control API
//! can pin to a single node for geolocation through a local mixed inbound.
//!
//! [`ProbeManager`] keeps at most one probe alive. Nodes the engine refuses
//! are excluded by [`validate_nodes`] rather than failing the whole batch.

mod control;
mod document;
mod engine;
mod errors;
mod manager;
mod parser;
mod ports;
mod process;
mod tags;
mod validate;

pub use control::{ControlClient, ControlError};
pub use document::{
    AUTO_GROUP_TAG, GEO_INBOUND_TAG, GEO_SELECTOR_TAG, ProbeLayout, SYSTEM_OUTBOUNDS,
};
pub use engine::{Engine, SingBoxEngine};
pub use errors::ProbeError;
pub use manager::{
    ProbeManager, ProbeOptions, ProbeSession, ProbeStatus, READINESS_POLL_INTERVAL,
};
pub use parser::{EngineErrorParser, ErrorParser, Exclusion};
pub use tags::{ProbeTagMap, probe_index, probe_tag};
pub use validate::{
    BrokenNode, CheckError, ConfigCheck, ITERATION_MARGIN, ValidatedNodes, ValidationError,
    validate_nodes,
};

pub(crate) const PROBE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::probe");
