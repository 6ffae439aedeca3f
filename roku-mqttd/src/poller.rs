//! Per-device adaptive polling.
//!
//! Each device has at most one probe outstanding: a probe timer is armed,
//! the probe runs, and only its result arms the next one. Every timer carries
//! a generation number so a timer that fires after it was superseded is
//! ignored even if the abort raced with delivery.

use std::collections::HashMap;
use std::time::Duration;
use shared::protocol::HOME_LABEL;
use shared::types::{ActiveApp, DeviceInfo, PowerState};
use crate::bridge::BridgeEvent;
use crate::config::Config;
use crate::ecp::ProbeError;
use crate::registry::{DeviceRecord, PollMode};
use crate::scheduler::{Scheduler, TimerHandle};

/// Time a device stays in `Active` after the last activation
pub const ACTIVE_DWELL: Duration = Duration::from_secs(60);

/// Delay before the first probe after an activation
pub const ACTIVATION_PROBE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub active: Duration,
    pub idle: Duration,
    pub retries: u32,
    pub active_dwell: Duration,
    pub activation_delay: Duration,
}

impl PollSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            active: config.poll_active_interval(),
            idle: config.poll_idle_interval(),
            retries: config.poll_retries,
            active_dwell: ACTIVE_DWELL,
            activation_delay: ACTIVATION_PROBE_DELAY,
        }
    }

    pub fn interval(&self, mode: PollMode) -> Duration {
        match mode {
            PollMode::Active => self.active,
            PollMode::Idle => self.idle,
        }
    }
}

/// A change to publish on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    App(String),
    Power(PowerState),
}

/// Work the bridge carries out on behalf of the poller
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(StateChange),
    /// Mark the device address as recently alive
    TouchAddress,
    /// Let discovery probe the address again
    ForgetAddress,
    /// Ask the device for its power mode
    QueryPower,
}

#[derive(Debug, Default)]
enum ProbeState {
    /// Terminal state reached, or not started
    #[default]
    Stopped,
    Armed {
        generation: u64,
        timer: TimerHandle,
    },
    /// A probe is running; `expedite` asks for a quick follow-up
    InFlight {
        expedite: bool,
    },
}

#[derive(Debug, Default)]
struct PollSlot {
    probe: ProbeState,
    decay: Option<(u64, TimerHandle)>,
    generation: u64,
}

impl PollSlot {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Drop pending timers. A probe in flight is left to finish.
    fn cancel_timers(&mut self) {
        self.probe = match std::mem::take(&mut self.probe) {
            ProbeState::Armed { timer, .. } => {
                timer.cancel();
                ProbeState::Stopped
            }
            other => other,
        };
        if let Some((_, timer)) = self.decay.take() {
            timer.cancel();
        }
    }

    fn arm_probe(&mut self, serial: &str, delay: Duration, scheduler: &mut impl Scheduler) {
        if let ProbeState::Armed { timer, .. } = std::mem::take(&mut self.probe) {
            timer.cancel();
        }
        let generation = self.next_generation();
        let timer = scheduler.after(
            delay,
            BridgeEvent::ProbeDue {
                serial: serial.to_string(),
                generation,
            },
        );
        self.probe = ProbeState::Armed { generation, timer };
    }

    fn activate(
        &mut self,
        settings: &PollSettings,
        record: &mut DeviceRecord,
        scheduler: &mut impl Scheduler,
    ) {
        tracing::debug!("{}: setActive", record.slug);
        record.mode = PollMode::Active;

        if let Some((_, timer)) = self.decay.take() {
            timer.cancel();
        }
        let generation = self.next_generation();
        let timer = scheduler.after(
            settings.active_dwell,
            BridgeEvent::DecayDue {
                serial: record.serial.clone(),
                generation,
            },
        );
        self.decay = Some((generation, timer));

        match &mut self.probe {
            ProbeState::InFlight { expedite } => *expedite = true,
            _ => self.arm_probe(&record.serial, settings.activation_delay, scheduler),
        }
    }
}

/// Owns the polling timers of every device and mutates their runtime fields.
#[derive(Debug)]
pub struct Poller {
    settings: PollSettings,
    slots: HashMap<String, PollSlot>,
}

impl Poller {
    pub fn new(settings: PollSettings) -> Self {
        Self {
            settings,
            slots: HashMap::new(),
        }
    }

    /// Begin polling a freshly registered device, replacing any earlier timers
    pub fn start(&mut self, record: &mut DeviceRecord, scheduler: &mut impl Scheduler) {
        // the slot is kept so generations stay unique per device
        let slot = self.slots.entry(record.serial.clone()).or_default();
        slot.cancel_timers();

        if record.power == PowerState::On {
            slot.activate(&self.settings, record, scheduler);
        } else {
            record.mode = PollMode::Idle;
            match &mut slot.probe {
                // its result arms the next probe
                ProbeState::InFlight { expedite } => *expedite = true,
                _ => slot.arm_probe(&record.serial, self.settings.idle, scheduler),
            }
        }
    }

    /// Force fast polling, restarting the dwell window
    pub fn activate(&mut self, record: &mut DeviceRecord, scheduler: &mut impl Scheduler) {
        let slot = self.slots.entry(record.serial.clone()).or_default();
        slot.activate(&self.settings, record, scheduler);
    }

    /// Dwell window elapsed. Returns false for a superseded timer.
    pub fn decay_due(
        &mut self,
        record: &mut DeviceRecord,
        generation: u64,
        scheduler: &mut impl Scheduler,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(&record.serial) else {
            return false;
        };
        if !matches!(slot.decay, Some((current, _)) if current == generation) {
            return false;
        }
        slot.decay = None;

        tracing::debug!("{}: setIdle", record.slug);
        record.mode = PollMode::Idle;
        if matches!(slot.probe, ProbeState::Armed { .. }) {
            slot.arm_probe(&record.serial, self.settings.idle, scheduler);
        }
        true
    }

    /// Probe timer fired. Returns true when the probe should be sent.
    pub fn probe_due(&mut self, serial: &str, generation: u64) -> bool {
        let Some(slot) = self.slots.get_mut(serial) else {
            return false;
        };
        match slot.probe {
            ProbeState::Armed { generation: current, .. } if current == generation => {
                slot.probe = ProbeState::InFlight { expedite: false };
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn is_probe_armed(&self, serial: &str) -> bool {
        self.slots
            .get(serial)
            .is_some_and(|slot| matches!(slot.probe, ProbeState::Armed { .. }))
    }

    #[cfg(test)]
    pub fn is_probe_in_flight(&self, serial: &str) -> bool {
        self.slots
            .get(serial)
            .is_some_and(|slot| matches!(slot.probe, ProbeState::InFlight { .. }))
    }

    /// Apply the result of an activity probe and arm the next one
    pub fn on_activity(
        &mut self,
        record: &mut DeviceRecord,
        result: Result<ActiveApp, ProbeError>,
        scheduler: &mut impl Scheduler,
    ) -> Vec<Effect> {
        let settings = &self.settings;
        let slot = self.slots.entry(record.serial.clone()).or_default();
        let in_flight = match slot.probe {
            ProbeState::InFlight { expedite } => {
                slot.probe = ProbeState::Stopped;
                Some(expedite)
            }
            _ => None,
        };

        let mut effects = Vec::new();
        let keep_polling = match result {
            Ok(app) => {
                effects.push(Effect::TouchAddress);
                record.consecutive_unreachable = 0;
                record.consecutive_query_failures = 0;

                let label = app.label();
                if label != record.app_state {
                    tracing::debug!("{}: changed app=\"{}\"", record.slug, label);
                    record.app_state = label.clone();
                    effects.push(Effect::Publish(StateChange::App(label.clone())));
                    if label == HOME_LABEL {
                        slot.activate(settings, record, scheduler);
                    }
                }
                let recovered = matches!(record.power, PowerState::Unreachable | PowerState::Gone);
                if recovered || (record.supports_suspend && app.is_home()) {
                    effects.push(Effect::QueryPower);
                }
                true
            }
            Err(ProbeError::Unreachable(reason)) => {
                record.consecutive_unreachable += 1;
                tracing::debug!(
                    "{}({}): unreachable {}/{}: {}",
                    record.slug,
                    record.address,
                    record.consecutive_unreachable,
                    settings.retries,
                    reason
                );
                if record.consecutive_unreachable > settings.retries {
                    effects.push(Effect::ForgetAddress);
                    if record.power != PowerState::Unreachable {
                        record.power = PowerState::Unreachable;
                        effects.push(Effect::Publish(StateChange::Power(PowerState::Unreachable)));
                    }
                    false
                } else {
                    true
                }
            }
            Err(ProbeError::Other(reason)) => {
                effects.push(Effect::TouchAddress);
                record.consecutive_query_failures += 1;
                tracing::debug!(
                    "{}({}): query failed {}/{}: {}",
                    record.slug,
                    record.address,
                    record.consecutive_query_failures,
                    settings.retries,
                    reason
                );
                if record.consecutive_query_failures > settings.retries {
                    if record.power != PowerState::Gone {
                        record.power = PowerState::Gone;
                        effects.push(Effect::Publish(StateChange::Power(PowerState::Gone)));
                    }
                    false
                } else {
                    record.consecutive_unreachable = 0;
                    true
                }
            }
        };

        // only the probe that was in flight may arm its successor
        if let Some(expedite) = in_flight {
            if (keep_polling || expedite) && matches!(slot.probe, ProbeState::Stopped) {
                let delay = if expedite {
                    settings.activation_delay
                } else {
                    settings.interval(record.mode)
                };
                slot.arm_probe(&record.serial, delay, scheduler);
            }
        }

        effects
    }

    /// Apply a power-mode query made while the device sat on its home screen
    pub fn on_power_info(
        &mut self,
        record: &mut DeviceRecord,
        result: Result<DeviceInfo, ProbeError>,
    ) -> Vec<Effect> {
        match result {
            Ok(info) if info.power_state != record.power => {
                record.power = info.power_state;
                vec![Effect::Publish(StateChange::Power(record.power.clone()))]
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::warn!("{}({}): power query failed: {}", record.slug, record.address, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use crate::scheduler::RecordingScheduler;

    fn settings() -> PollSettings {
        PollSettings {
            active: Duration::from_secs(2),
            idle: Duration::from_secs(5),
            retries: 1,
            active_dwell: ACTIVE_DWELL,
            activation_delay: ACTIVATION_PROBE_DELAY,
        }
    }

    fn record(power: PowerState) -> DeviceRecord {
        DeviceRecord {
            serial: "S1".to_string(),
            address: IpAddr::from([192, 168, 1, 10]),
            slug: "den".to_string(),
            name: "Den".to_string(),
            app_state: "Netflix".to_string(),
            power,
            mode: PollMode::Idle,
            consecutive_unreachable: 0,
            consecutive_query_failures: 0,
            known_apps: None,
            supports_suspend: true,
            debug: false,
        }
    }

    fn home() -> ActiveApp {
        ActiveApp { id: None, name: "Roku".to_string(), screensaver: None }
    }

    fn netflix() -> ActiveApp {
        ActiveApp { id: Some("12".to_string()), name: "Netflix".to_string(), screensaver: None }
    }

    fn probe_timers(events: &[(Duration, BridgeEvent)]) -> Vec<(Duration, u64)> {
        events
            .iter()
            .filter_map(|(delay, event)| match event {
                BridgeEvent::ProbeDue { generation, .. } => Some((*delay, *generation)),
                _ => None,
            })
            .collect()
    }

    fn decay_timers(events: &[(Duration, BridgeEvent)]) -> Vec<(Duration, u64)> {
        events
            .iter()
            .filter_map(|(delay, event)| match event {
                BridgeEvent::DecayDue { generation, .. } => Some((*delay, *generation)),
                _ => None,
            })
            .collect()
    }

    /// Fire the single armed probe and return its delay
    fn fire_probe(poller: &mut Poller, sched: &mut RecordingScheduler) -> Duration {
        let probes = probe_timers(&sched.take());
        assert_eq!(probes.len(), 1, "expected exactly one armed probe");
        let (delay, generation) = probes[0];
        assert!(poller.probe_due("S1", generation));
        delay
    }

    #[test]
    fn test_start_powered_on_goes_active() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::On);

        poller.start(&mut rec, &mut sched);

        assert_eq!(rec.mode, PollMode::Active);
        let events = sched.take();
        assert_eq!(probe_timers(&events).len(), 1);
        assert_eq!(probe_timers(&events)[0].0, ACTIVATION_PROBE_DELAY);
        assert_eq!(decay_timers(&events)[0].0, ACTIVE_DWELL);
    }

    #[test]
    fn test_start_standby_polls_idle() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::DisplayOff);

        poller.start(&mut rec, &mut sched);

        assert_eq!(rec.mode, PollMode::Idle);
        let events = sched.take();
        assert_eq!(probe_timers(&events)[0].0, Duration::from_secs(5));
        assert!(decay_timers(&events).is_empty());
    }

    #[test]
    fn test_unreachable_ladder_publishes_once() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::DisplayOff);
        poller.start(&mut rec, &mut sched);

        fire_probe(&mut poller, &mut sched);
        let effects = poller.on_activity(&mut rec, Err(ProbeError::Unreachable("timeout".into())), &mut sched);
        assert!(effects.is_empty());
        assert_eq!(rec.consecutive_unreachable, 1);

        fire_probe(&mut poller, &mut sched);
        let effects = poller.on_activity(&mut rec, Err(ProbeError::Unreachable("timeout".into())), &mut sched);
        assert_eq!(
            effects,
            vec![
                Effect::ForgetAddress,
                Effect::Publish(StateChange::Power(PowerState::Unreachable)),
            ]
        );
        assert_eq!(rec.power, PowerState::Unreachable);
        assert!(sched.take().is_empty(), "no probe after the terminal state");
        assert!(!poller.is_probe_armed("S1"));

        let effects = poller.on_activity(&mut rec, Err(ProbeError::Unreachable("timeout".into())), &mut sched);
        assert_eq!(effects, vec![Effect::ForgetAddress]);
    }

    #[test]
    fn test_forced_probe_revives_unreachable_device() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::DisplayOff);
        rec.supports_suspend = false;
        poller.start(&mut rec, &mut sched);
        fire_probe(&mut poller, &mut sched);
        poller.on_activity(&mut rec, Err(ProbeError::Unreachable("timeout".into())), &mut sched);
        fire_probe(&mut poller, &mut sched);
        poller.on_activity(&mut rec, Err(ProbeError::Unreachable("timeout".into())), &mut sched);
        assert_eq!(rec.power, PowerState::Unreachable);

        poller.activate(&mut rec, &mut sched);
        fire_probe(&mut poller, &mut sched);
        let effects = poller.on_activity(&mut rec, Ok(netflix()), &mut sched);

        assert_eq!(effects, vec![Effect::TouchAddress, Effect::QueryPower]);
        assert_eq!(rec.consecutive_unreachable, 0);
        assert!(poller.is_probe_armed("S1"));
    }

    #[test]
    fn test_query_failures_end_gone() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::DisplayOff);
        poller.start(&mut rec, &mut sched);
        rec.consecutive_unreachable = 1;

        fire_probe(&mut poller, &mut sched);
        let effects = poller.on_activity(&mut rec, Err(ProbeError::Other("500".into())), &mut sched);
        assert_eq!(effects, vec![Effect::TouchAddress]);
        assert_eq!(rec.consecutive_unreachable, 0);

        fire_probe(&mut poller, &mut sched);
        let effects = poller.on_activity(&mut rec, Err(ProbeError::Other("500".into())), &mut sched);
        assert_eq!(
            effects,
            vec![Effect::TouchAddress, Effect::Publish(StateChange::Power(PowerState::Gone))]
        );
        assert!(!poller.is_probe_armed("S1"));
    }

    #[test]
    fn test_success_resets_counters_and_publishes_change() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::DisplayOff);
        rec.supports_suspend = false;
        poller.start(&mut rec, &mut sched);
        rec.consecutive_unreachable = 1;
        rec.consecutive_query_failures = 1;

        fire_probe(&mut poller, &mut sched);
        let effects = poller.on_activity(&mut rec, Ok(netflix()), &mut sched);
        assert_eq!(effects, vec![Effect::TouchAddress]);
        assert_eq!(rec.consecutive_unreachable, 0);
        assert_eq!(rec.consecutive_query_failures, 0);

        rec.app_state = "Hulu".to_string();
        assert_eq!(fire_probe(&mut poller, &mut sched), Duration::from_secs(5));
        let effects = poller.on_activity(&mut rec, Ok(netflix()), &mut sched);
        assert_eq!(
            effects,
            vec![Effect::TouchAddress, Effect::Publish(StateChange::App("Netflix".to_string()))]
        );
        assert_eq!(rec.app_state, "Netflix");
    }

    #[test]
    fn test_return_home_activates_and_checks_power() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::DisplayOff);
        poller.start(&mut rec, &mut sched);

        fire_probe(&mut poller, &mut sched);
        let effects = poller.on_activity(&mut rec, Ok(home()), &mut sched);

        assert_eq!(
            effects,
            vec![
                Effect::TouchAddress,
                Effect::Publish(StateChange::App("Home".to_string())),
                Effect::QueryPower,
            ]
        );
        assert_eq!(rec.mode, PollMode::Active);
        let events = sched.take();
        assert_eq!(probe_timers(&events), vec![(ACTIVATION_PROBE_DELAY, probe_timers(&events)[0].1)]);
        assert_eq!(decay_timers(&events).len(), 1);
    }

    #[test]
    fn test_force_active_replaces_idle_probe() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::DisplayOff);
        poller.start(&mut rec, &mut sched);
        let idle_probe = probe_timers(&sched.take())[0].1;

        poller.activate(&mut rec, &mut sched);

        let events = sched.take();
        let probes = probe_timers(&events);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].0, ACTIVATION_PROBE_DELAY);
        assert!(!poller.probe_due("S1", idle_probe), "stale idle probe must be ignored");
        assert!(poller.probe_due("S1", probes[0].1));
        assert!(!poller.probe_due("S1", probes[0].1), "a probe fires once");
    }

    #[test]
    fn test_activate_during_flight_expedites_without_overlap() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::DisplayOff);
        rec.supports_suspend = false;
        poller.start(&mut rec, &mut sched);
        fire_probe(&mut poller, &mut sched);

        poller.activate(&mut rec, &mut sched);
        assert!(probe_timers(&sched.take()).is_empty());
        assert!(poller.is_probe_in_flight("S1"));

        poller.on_activity(&mut rec, Ok(netflix()), &mut sched);
        let probes = probe_timers(&sched.take());
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].0, ACTIVATION_PROBE_DELAY);
    }

    #[test]
    fn test_restart_while_in_flight_does_not_overlap() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::DisplayOff);
        rec.supports_suspend = false;
        poller.start(&mut rec, &mut sched);
        fire_probe(&mut poller, &mut sched);

        // a rescan re-identifies the device before its probe answers
        poller.start(&mut rec, &mut sched);
        assert!(probe_timers(&sched.take()).is_empty());
        assert!(poller.is_probe_in_flight("S1"));

        poller.on_activity(&mut rec, Ok(netflix()), &mut sched);
        let probes = probe_timers(&sched.take());
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].0, ACTIVATION_PROBE_DELAY);
        assert!(poller.is_probe_armed("S1"));
    }

    #[test]
    fn test_restart_powered_on_while_in_flight_does_not_overlap() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::On);
        rec.supports_suspend = false;
        poller.start(&mut rec, &mut sched);
        fire_probe(&mut poller, &mut sched);

        poller.start(&mut rec, &mut sched);
        let events = sched.take();
        assert!(probe_timers(&events).is_empty());
        assert_eq!(decay_timers(&events).len(), 1);
        assert!(poller.is_probe_in_flight("S1"));
    }

    #[test]
    fn test_decay_returns_to_idle_cadence() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::On);
        rec.supports_suspend = false;
        poller.start(&mut rec, &mut sched);
        let first_decay = decay_timers(&sched.scheduled)[0].1;

        // re-entering Active supersedes the first dwell window
        poller.activate(&mut rec, &mut sched);
        let events = sched.take();
        let second_decay = decay_timers(&events).last().unwrap().1;
        assert!(!poller.decay_due(&mut rec, first_decay, &mut sched));
        assert_eq!(rec.mode, PollMode::Active);

        assert!(poller.decay_due(&mut rec, second_decay, &mut sched));
        assert_eq!(rec.mode, PollMode::Idle);
        let probes = probe_timers(&sched.take());
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].0, Duration::from_secs(5));
    }

    #[test]
    fn test_next_delay_follows_current_mode() {
        let mut poller = Poller::new(settings());
        let mut sched = RecordingScheduler::default();
        let mut rec = record(PowerState::On);
        rec.supports_suspend = false;
        poller.start(&mut rec, &mut sched);
        let decay = decay_timers(&sched.scheduled)[0].1;
        fire_probe(&mut poller, &mut sched);

        // mode drops to Idle while the probe is out
        assert!(poller.decay_due(&mut rec, decay, &mut sched));
        poller.on_activity(&mut rec, Ok(netflix()), &mut sched);

        let probes = probe_timers(&sched.take());
        assert_eq!(probes, vec![(Duration::from_secs(5), probes[0].1)]);
    }

    #[test]
    fn test_power_info_publishes_on_change_only() {
        let mut poller = Poller::new(settings());
        let mut rec = record(PowerState::On);
        let mut info = DeviceInfo {
            serial_number: "S1".to_string(),
            user_device_name: None,
            friendly_device_name: None,
            model_name: None,
            power_state: PowerState::On,
            supports_suspend: true,
        };

        assert!(poller.on_power_info(&mut rec, Ok(info.clone())).is_empty());

        info.power_state = PowerState::DisplayOff;
        assert_eq!(
            poller.on_power_info(&mut rec, Ok(info)),
            vec![Effect::Publish(StateChange::Power(PowerState::DisplayOff))]
        );
        assert_eq!(rec.power, PowerState::DisplayOff);

        assert!(poller.on_power_info(&mut rec, Err(ProbeError::Other("boom".into()))).is_empty());
    }
}
