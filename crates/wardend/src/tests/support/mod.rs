//! Test doubles and fixtures shared by the daemon's unit and behavioural
//! suites.

mod engine;
mod hooks;
mod measurer;
mod rig;

use std::time::{Duration, Instant};

pub use engine::FakeEngine;
pub use hooks::RecordingHooks;
pub use measurer::ScriptedMeasurer;
pub use rig::{HEALTH_URL, VerifierRig};

use crate::store::UnifiedNode;

/// A pending trojan node served from `<name>.example`.
pub fn node(name: &str, port: u16) -> UnifiedNode {
    UnifiedNode::pending(name, "trojan", format!("{name}.example"), port)
        .with_extra("password", "secret")
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
