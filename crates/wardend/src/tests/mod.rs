//! Test suites for the warden daemon.

pub(crate) mod support;
