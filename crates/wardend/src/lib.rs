//! Verification daemon for proxy nodes.
//!
//! The daemon keeps a pool of proxy nodes honest. Nodes discovered by a
//! subscription start out pending; a verification cycle loads every pending
//! and verified node into a single probe process of the proxy engine, measures
//! each one through the engine's control API, and then promotes, demotes or
//! archives nodes according to their consecutive failure count.
//!
//! The crate is organised around four collaborators:
//!
//! - [`events`] fans lifecycle notifications out to any number of
//!   subscribers without letting a slow reader stall the publisher.
//! - [`probe`] renders, validates and supervises the probe process, excluding
//!   nodes the engine refuses to load.
//! - [`verify`] runs a verification cycle and records its outcome.
//! - [`scheduler`] drives subscription refreshes and verification cycles on
//!   configurable intervals, and accepts manual triggers.
//!
//! [`bootstrap_with`] wires these together from a resolved
//! [`warden_config::Config`] and a [`store::Store`]; [`run_daemon`] adds the
//! production collaborators and blocks until a termination signal arrives.

mod bootstrap;
pub mod events;
mod launch;
pub mod probe;
pub mod scheduler;
pub mod store;
mod telemetry;
pub mod verify;

pub use bootstrap::{
    BootstrapError, ConfigLoader, Daemon, DaemonHooks, EngineProvider, SingBoxProvider,
    StaticConfigLoader, SystemConfigLoader, bootstrap_with,
};
pub use launch::{
    LaunchError, LaunchPlan, ShutdownError, ShutdownSignal, SystemShutdownSignal, run_daemon,
    run_daemon_with,
};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
