//! Measurer double answering from per-address scripts.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::probe::{ControlError, ProbeSession};
use crate::store::{GeoInfo, NodeKey};
use crate::tests::support::HEALTH_URL;
use crate::verify::{MeasureError, Measurer};

/// Measurer whose results are scripted by server address.
///
/// Health checks pass for addresses marked healthy. Site checks pass for
/// `(address, url)` pairs marked reachable. Geolocation answers from the
/// scripted table.
#[derive(Default)]
pub struct ScriptedMeasurer {
    healthy: Mutex<HashSet<String>>,
    reachable: Mutex<HashSet<(String, String)>>,
    geo: Mutex<HashMap<String, GeoInfo>>,
    delays: AtomicUsize,
    lookups: AtomicUsize,
}

impl ScriptedMeasurer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, address: &str, healthy: bool) {
        let mut set = self.healthy.lock().expect("healthy lock");
        if healthy {
            set.insert(address.to_owned());
        } else {
            set.remove(address);
        }
    }

    pub fn set_reachable(&self, address: &str, url: &str) {
        self.reachable
            .lock()
            .expect("reachable lock")
            .insert((address.to_owned(), url.to_owned()));
    }

    pub fn set_geo(&self, address: &str, country: &str, country_code: &str) {
        self.geo.lock().expect("geo lock").insert(
            address.to_owned(),
            GeoInfo {
                country: country.to_owned(),
                country_code: country_code.to_owned(),
            },
        );
    }

    pub fn delay_calls(&self) -> usize {
        self.delays.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn key(session: &ProbeSession, tag: &str) -> Result<NodeKey, MeasureError> {
        session
            .tags
            .key_for(tag)
            .cloned()
            .ok_or_else(|| MeasureError::NotProbed {
                reason: format!("unknown tag {tag}"),
            })
    }
}

fn timeout(tag: &str) -> MeasureError {
    MeasureError::Control(ControlError::Status {
        url: format!("/proxies/{tag}/delay"),
        status: 504,
        message: String::from("Timeout"),
    })
}

impl Measurer for ScriptedMeasurer {
    fn delay(&self, session: &ProbeSession, tag: &str, url: &str) -> Result<u64, MeasureError> {
        self.delays.fetch_add(1, Ordering::SeqCst);
        let key = Self::key(session, tag)?;
        let passed = if url == HEALTH_URL {
            self.healthy.lock().expect("healthy lock").contains(&key.address)
        } else {
            self.reachable
                .lock()
                .expect("reachable lock")
                .contains(&(key.address.clone(), url.to_owned()))
        };
        if passed { Ok(42) } else { Err(timeout(tag)) }
    }

    fn geolocate(
        &self,
        session: &ProbeSession,
        tag: &str,
        _lookup_url: &str,
    ) -> Result<GeoInfo, MeasureError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let key = Self::key(session, tag)?;
        self.geo
            .lock()
            .expect("geo lock")
            .get(&key.address)
            .cloned()
            .ok_or_else(|| MeasureError::Lookup {
                message: String::from("private range"),
            })
    }
}
