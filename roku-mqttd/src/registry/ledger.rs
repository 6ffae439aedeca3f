use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Last time each address was probed or answered.
///
/// Discovery skips an address while its entry is younger than the freshness
/// window; forgetting an address makes it eligible again immediately.
#[derive(Debug)]
pub struct LivenessLedger {
    window: Duration,
    probed: HashMap<IpAddr, Instant>,
}

impl LivenessLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            probed: HashMap::new(),
        }
    }

    pub fn is_fresh(&self, address: &IpAddr, now: Instant) -> bool {
        self.probed
            .get(address)
            .is_some_and(|last| now.saturating_duration_since(*last) < self.window)
    }

    pub fn touch(&mut self, address: IpAddr, now: Instant) {
        self.probed.insert(address, now);
    }

    pub fn forget(&mut self, address: &IpAddr) {
        self.probed.remove(address);
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        self.probed.contains_key(address)
    }

    pub fn clear(&mut self) {
        self.probed.clear();
    }
}
