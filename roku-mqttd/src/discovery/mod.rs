//! Finding devices: configured address ranges, SSDP answers and bus
//! announcements all funnel into `probe`, which skips addresses seen recently.

pub mod range;
pub mod ssdp;

use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use crate::bridge::BridgeEvent;
use crate::ecp::ProbeError;
use crate::registry::LivenessLedger;
use crate::scheduler::Scheduler;
use range::RangeSpec;

/// Delay before the first probe of a range scan
pub const SCAN_START_DELAY: Duration = Duration::from_millis(50);

/// Gap between consecutive probes of a range scan
pub const SCAN_STAGGER: Duration = Duration::from_millis(100);

/// Delay before probing an address answering an SSDP search
pub const SSDP_PROBE_DELAY: Duration = Duration::from_millis(100);

/// Delay before probing an address announced on the bus, so the device can finish booting
pub const ANNOUNCE_PROBE_DELAY: Duration = Duration::from_secs(5);

/// What a `scan_all` kicked off
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanSummary {
    /// Broadcast search requested
    pub search: bool,
    pub scheduled: usize,
    /// Ranges dropped because they did not parse
    pub rejected: usize,
}

#[derive(Debug)]
pub struct Discovery {
    ranges: Vec<RangeSpec>,
    broadcast: bool,
    ledger: LivenessLedger,
}

impl Discovery {
    pub fn new(ranges: Vec<RangeSpec>, broadcast: bool, freshness: Duration) -> Self {
        Self {
            ranges,
            broadcast,
            ledger: LivenessLedger::new(freshness),
        }
    }

    pub fn ledger(&self) -> &LivenessLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut LivenessLedger {
        &mut self.ledger
    }

    /// Forget every address and schedule a staggered probe of each configured one.
    ///
    /// A malformed range is logged and skipped; the others still run.
    pub fn scan_all(&mut self, scheduler: &mut impl Scheduler) -> ScanSummary {
        self.ledger.clear();

        let mut summary = ScanSummary {
            search: self.broadcast,
            ..Default::default()
        };
        let mut delay = SCAN_START_DELAY;

        for spec in &self.ranges {
            let addresses = match range::expand(spec) {
                Ok(addresses) => addresses,
                Err(e) => {
                    tracing::error!("Invalid roku_ips entry {}: {}", spec, e);
                    summary.rejected += 1;
                    continue;
                }
            };
            for address in addresses {
                scheduler.after(delay, BridgeEvent::Probe(address));
                delay += SCAN_STAGGER;
                summary.scheduled += 1;
            }
        }

        tracing::debug!(
            "Scan: {} probe(s) scheduled, {} range(s) rejected, broadcast={}",
            summary.scheduled,
            summary.rejected,
            summary.search
        );
        summary
    }

    /// Schedule a probe triggered by an SSDP answer or a bus announcement
    pub fn probe_later(&self, address: IpAddr, delay: Duration, scheduler: &mut impl Scheduler) {
        scheduler.after(delay, BridgeEvent::Probe(address));
    }

    /// Claim an address for an identity probe; false when it was probed recently
    pub fn begin_probe(&mut self, address: IpAddr, now: Instant) -> bool {
        if self.ledger.is_fresh(&address, now) {
            tracing::trace!("{}: probed recently, skipping", address);
            return false;
        }
        self.ledger.touch(address, now);
        true
    }

    /// An identity probe failed: nothing there, or not a device we can talk to
    pub fn identity_failed(&mut self, address: IpAddr, error: &ProbeError) {
        match error {
            ProbeError::Unreachable(_) => {
                self.ledger.forget(&address);
            }
            ProbeError::Other(reason) => {
                tracing::debug!("{}: Not a Roku: {}", address, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RecordingScheduler;

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn discovery(ranges: &[&str]) -> Discovery {
        Discovery::new(
            ranges.iter().map(|r| RangeSpec::Text(r.to_string())).collect(),
            false,
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_scan_staggers_probes() {
        let mut discovery = discovery(&["10.0.0.1-10.0.0.3", "10.0.0.9"]);
        let mut scheduler = RecordingScheduler::default();

        let summary = discovery.scan_all(&mut scheduler);
        assert_eq!(summary.scheduled, 4);
        assert!(!summary.search);

        let scheduled = scheduler.take();
        let delays: Vec<u64> = scheduled.iter().map(|(d, _)| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![50, 150, 250, 350]);
        assert_eq!(scheduled[3].1, BridgeEvent::Probe(addr(9)));
    }

    #[test]
    fn test_bad_range_does_not_block_others() {
        let mut discovery = discovery(&["nonsense", "10.0.0.4"]);
        let mut scheduler = RecordingScheduler::default();

        let summary = discovery.scan_all(&mut scheduler);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.scheduled, 1);
        assert_eq!(scheduler.take()[0].1, BridgeEvent::Probe(addr(4)));
    }

    #[test]
    fn test_scan_clears_ledger() {
        let mut discovery = discovery(&[]);
        let now = Instant::now();
        assert!(discovery.begin_probe(addr(5), now));
        assert!(!discovery.begin_probe(addr(5), now));

        discovery.scan_all(&mut RecordingScheduler::default());
        assert!(discovery.begin_probe(addr(5), now));
    }

    #[test]
    fn test_unreachable_identity_is_forgotten() {
        let mut discovery = discovery(&[]);
        let now = Instant::now();
        discovery.begin_probe(addr(6), now);
        discovery.begin_probe(addr(7), now);

        discovery.identity_failed(addr(6), &ProbeError::Unreachable("timeout".into()));
        discovery.identity_failed(addr(7), &ProbeError::Other("404".into()));

        assert!(!discovery.ledger().contains(&addr(6)));
        assert!(discovery.ledger().is_fresh(&addr(7), now));
    }
}
