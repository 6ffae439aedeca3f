//! The bridge actor.
//!
//! One task owns the registry, discovery ledger and poller. Network work is
//! handed to the device worker and comes back as `BridgeEvent`s, as do timers
//! and inbound bus messages, so device state is only ever touched here.

use std::net::IpAddr;
use std::time::Duration;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::types::{ActiveApp, AppInfo, DeviceInfo, PowerState};
use crate::bus::{format_topic, DeviceAction, Dispatcher, Publication, Route};
use crate::command::{self, Action};
use crate::config::{parse_flag, Config};
use crate::discovery::{Discovery, ANNOUNCE_PROBE_DELAY, SSDP_PROBE_DELAY};
use crate::ecp::worker::Identity;
use crate::ecp::{DeviceRequest, ProbeError};
use crate::keys::KeyAliasTable;
use crate::poller::{Effect, PollSettings, Poller, StateChange};
use crate::registry::{Registry, Upsert};
use crate::scheduler::Scheduler;

/// Delay before a scan requested over the bus, and before the first scan
pub const SCAN_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Rescan every configured range, plus SSDP when enabled
    ScanAll,
    /// Identity-probe an address unless it was probed recently
    Probe(IpAddr),
    /// An SSDP search got an answer from this address
    Discovered(IpAddr),
    Identified {
        address: IpAddr,
        result: Result<Identity, ProbeError>,
    },
    Activity {
        serial: String,
        result: Result<ActiveApp, ProbeError>,
    },
    PowerInfo {
        serial: String,
        result: Result<DeviceInfo, ProbeError>,
    },
    AppsListed {
        serial: String,
        apps: Vec<AppInfo>,
    },
    CommandSent {
        serial: String,
        command: &'static str,
        result: Result<(), ProbeError>,
    },
    ProbeDue {
        serial: String,
        generation: u64,
    },
    DecayDue {
        serial: String,
        generation: u64,
    },
    /// Inbound bus message
    Message {
        topic: String,
        payload: String,
    },
}

/// Publish templates for per-device state
#[derive(Debug, Clone, Default)]
struct Topics {
    state: Option<String>,
    app: Option<String>,
}

pub struct Bridge<S: Scheduler> {
    registry: Registry,
    discovery: Discovery,
    poller: Poller,
    keys: KeyAliasTable,
    dispatcher: Dispatcher,
    topics: Topics,
    debug_default: bool,
    scheduler: S,
    requests: mpsc::UnboundedSender<DeviceRequest>,
    outbound: mpsc::UnboundedSender<Publication>,
}

impl<S: Scheduler> Bridge<S> {
    pub fn new(
        config: &Config,
        keys: KeyAliasTable,
        scheduler: S,
        requests: mpsc::UnboundedSender<DeviceRequest>,
        outbound: mpsc::UnboundedSender<Publication>,
    ) -> Result<Self> {
        Ok(Self {
            registry: Registry::new(config.slug_separator.clone()),
            discovery: Discovery::new(
                config.roku_ips.clone(),
                config.discover_upnp,
                config.discover_expire(),
            ),
            poller: Poller::new(PollSettings::from_config(config)),
            keys,
            dispatcher: Dispatcher::new(config)?,
            topics: Topics {
                state: config.roku_state_topic.clone(),
                app: config.roku_app_topic.clone(),
            },
            debug_default: config.debug,
            scheduler,
            requests,
            outbound,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn handle(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::ScanAll => {
                let summary = self.discovery.scan_all(&mut self.scheduler);
                if summary.search {
                    self.request(DeviceRequest::Search);
                }
            }
            BridgeEvent::Discovered(address) => {
                self.discovery.probe_later(address, SSDP_PROBE_DELAY, &mut self.scheduler);
            }
            BridgeEvent::Probe(address) => {
                if self.discovery.begin_probe(address, Instant::now()) {
                    self.request(DeviceRequest::Identify { address });
                }
            }
            BridgeEvent::Identified { address, result } => match result {
                Ok(identity) => self.register(address, identity),
                Err(e) => self.discovery.identity_failed(address, &e),
            },
            BridgeEvent::Activity { serial, result } => {
                let Some(record) = self.registry.get_mut(&serial) else {
                    return;
                };
                if record.debug {
                    tracing::info!("{}: active app {:?}", record.slug, result);
                }
                let effects = self.poller.on_activity(record, result, &mut self.scheduler);
                self.apply(&serial, effects);
            }
            BridgeEvent::PowerInfo { serial, result } => {
                let Some(record) = self.registry.get_mut(&serial) else {
                    return;
                };
                if record.debug {
                    tracing::info!("{}: device info {:?}", record.slug, result);
                }
                let effects = self.poller.on_power_info(record, result);
                self.apply(&serial, effects);
            }
            BridgeEvent::AppsListed { serial, apps } => {
                tracing::debug!("{}: {} app(s) installed", serial, apps.len());
                self.registry.set_apps(&serial, apps);
            }
            BridgeEvent::CommandSent { serial, command, result } => {
                let slug = self.registry.get(&serial).map_or(serial.as_str(), |r| r.slug.as_str());
                match result {
                    Ok(()) => tracing::debug!("{}: {} sent", slug, command),
                    Err(e) => tracing::warn!("{}: {} failed: {}", slug, command, e),
                }
            }
            BridgeEvent::ProbeDue { serial, generation } => {
                if !self.poller.probe_due(&serial, generation) {
                    return;
                }
                if let Some(record) = self.registry.get(&serial) {
                    let address = record.address;
                    self.request(DeviceRequest::ActiveApp { serial, address });
                }
            }
            BridgeEvent::DecayDue { serial, generation } => {
                if let Some(record) = self.registry.get_mut(&serial) {
                    self.poller.decay_due(record, generation, &mut self.scheduler);
                }
            }
            BridgeEvent::Message { topic, payload } => self.on_message(&topic, &payload),
        }
    }

    /// Listen for events until cancelled
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<BridgeEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    tracing::trace!("Bridge event: {:?}", event);
                    self.handle(event);
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Bridge shutting down with {} device(s) known", self.registry.len());
                    break;
                }
            }
        }

        Ok(())
    }

    fn register(&mut self, address: IpAddr, identity: Identity) {
        let Identity { info, app } = identity;
        let serial = info.serial_number.clone();
        let upsert = self
            .registry
            .upsert(address, &info, app.as_ref(), self.debug_default);
        self.discovery.ledger_mut().touch(address, Instant::now());

        let Some(record) = self.registry.get_mut(&serial) else {
            return;
        };
        let verb = match upsert {
            Upsert::New => "Found",
            Upsert::Refreshed => "Refresh",
        };
        tracing::info!(
            "{}: {} name=\"{}\" slug={} power={}",
            verb,
            address,
            record.name,
            record.slug,
            record.power.wire_label()
        );
        if record.debug {
            tracing::info!("{}: {:?}", record.slug, info);
        }

        let slug = record.slug.clone();
        let power = record.power.clone();
        let app_state = record.app_state.clone();
        self.poller.start(record, &mut self.scheduler);

        self.publish_power(&slug, &power);
        if app.is_some() {
            self.publish_app(&slug, &app_state);
        }
        self.request(DeviceRequest::ListApps { serial, address });
    }

    fn apply(&mut self, serial: &str, effects: Vec<Effect>) {
        let Some(record) = self.registry.get(serial) else {
            return;
        };
        let slug = record.slug.clone();
        let address = record.address;

        for effect in effects {
            match effect {
                Effect::Publish(StateChange::App(label)) => self.publish_app(&slug, &label),
                Effect::Publish(StateChange::Power(power)) => {
                    tracing::info!("{}: power={}", slug, power.wire_label());
                    self.publish_power(&slug, &power);
                }
                Effect::TouchAddress => self.discovery.ledger_mut().touch(address, Instant::now()),
                Effect::ForgetAddress => self.discovery.ledger_mut().forget(&address),
                Effect::QueryPower => self.request(DeviceRequest::PowerInfo {
                    serial: serial.to_string(),
                    address,
                }),
            }
        }
    }

    fn on_message(&mut self, topic: &str, payload: &str) {
        match self.dispatcher.route(&self.registry, topic, payload) {
            Route::Ping | Route::Dropped => {}
            Route::Scan => {
                self.scheduler.after(SCAN_DELAY, BridgeEvent::ScanAll);
            }
            Route::Announce(address) => {
                if !self.discovery.ledger().contains(&address) {
                    tracing::debug!("Device online: {}", address);
                }
                self.discovery
                    .probe_later(address, ANNOUNCE_PROBE_DELAY, &mut self.scheduler);
            }
            Route::Command { serial, action, payload } => self.command(&serial, action, &payload),
        }
    }

    fn command(&mut self, serial: &str, action: DeviceAction, payload: &str) {
        let Some(record) = self.registry.get(serial) else {
            return;
        };
        let slug = record.slug.clone();
        let address = record.address;
        tracing::debug!("{}: action={:?} value=\"{}\"", slug, action, payload);

        match action {
            DeviceAction::Active => {}
            DeviceAction::Debug => {
                match parse_flag(payload) {
                    Some(flag) => {
                        if let Some(record) = self.registry.get_mut(serial) {
                            record.debug = flag;
                        }
                    }
                    None => tracing::warn!("{}: unrecognised debug value \"{}\"", slug, payload),
                }
                return;
            }
            DeviceAction::Keypress => {
                self.send_keys(serial, &slug, address, command::parse_keypress(&self.keys, payload));
            }
            DeviceAction::Text => {
                tracing::debug!("{}: send text: {}", slug, payload);
                self.send_keys(serial, &slug, address, command::parse_text(&self.keys, payload));
            }
            DeviceAction::App => match self.registry.find_app_by_slug(serial, payload) {
                Some(app) => {
                    tracing::debug!("{}: launch {} ({})", slug, app.name, app.id);
                    let app_id = app.id.clone();
                    self.request(DeviceRequest::Launch {
                        serial: serial.to_string(),
                        address,
                        app_id,
                    });
                }
                None => tracing::warn!("{}: unknown app \"{}\"", slug, payload),
            },
        }

        if let Some(record) = self.registry.get_mut(serial) {
            self.poller.activate(record, &mut self.scheduler);
        }
    }

    fn send_keys(
        &self,
        serial: &str,
        slug: &str,
        address: IpAddr,
        parsed: Result<Vec<Action>, command::CommandError>,
    ) {
        match parsed {
            Ok(actions) => self.request(DeviceRequest::SendKeys {
                serial: serial.to_string(),
                address,
                actions,
            }),
            Err(e) => tracing::warn!("{}: {}", slug, e),
        }
    }

    fn publish_power(&self, slug: &str, power: &PowerState) {
        if let Some(template) = &self.topics.state {
            self.publish(format_topic(template, slug), power.payload());
        }
    }

    fn publish_app(&self, slug: &str, label: &str) {
        if let Some(template) = &self.topics.app {
            self.publish(format_topic(template, slug), label.to_string());
        }
    }

    fn publish(&self, topic: String, payload: String) {
        if self.outbound.send(Publication::new(topic, payload)).is_err() {
            tracing::warn!("Publisher gone, dropping state update");
        }
    }

    fn request(&self, request: DeviceRequest) {
        if self.requests.send(request).is_err() {
            tracing::warn!("Device worker gone, dropping request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Key;
    use crate::registry::PollMode;
    use crate::scheduler::RecordingScheduler;

    struct Harness {
        bridge: Bridge<RecordingScheduler>,
        requests: mpsc::UnboundedReceiver<DeviceRequest>,
        outbound: mpsc::UnboundedReceiver<Publication>,
    }

    impl Harness {
        fn new() -> Self {
            let config = Config::from_toml(
                r#"
                poll_idle = 5
                poll_active = 2
                poll_retries = 1
                roku_set_topic = "roku/set"
                roku_state_topic = "roku/%s/state"
                roku_app_topic = "roku/%s/app"
                new_roku_topic = "network/online"
                roku_ips = ["10.0.0.1-10.0.0.2"]
                "#,
            )
            .unwrap();
            let (requests_tx, requests) = mpsc::unbounded_channel();
            let (outbound_tx, outbound) = mpsc::unbounded_channel();
            let bridge = Bridge::new(
                &config,
                KeyAliasTable::build(),
                RecordingScheduler::default(),
                requests_tx,
                outbound_tx,
            )
            .unwrap();
            Self { bridge, requests, outbound }
        }

        fn requests(&mut self) -> Vec<DeviceRequest> {
            std::iter::from_fn(|| self.requests.try_recv().ok()).collect()
        }

        fn published(&mut self) -> Vec<(String, String)> {
            std::iter::from_fn(|| self.outbound.try_recv().ok())
                .map(|p| (p.topic, p.payload))
                .collect()
        }

        fn timers(&mut self) -> Vec<(Duration, BridgeEvent)> {
            self.bridge.scheduler.take()
        }

        /// Fire the pending probe timer, returning its delay
        fn fire_probe(&mut self) -> Duration {
            let (delay, event) = self
                .timers()
                .into_iter()
                .filter(|(_, e)| matches!(e, BridgeEvent::ProbeDue { .. }))
                .last()
                .expect("probe armed");
            self.bridge.handle(event);
            delay
        }

        fn register(&mut self, power: PowerState) {
            let address = addr();
            self.bridge.handle(BridgeEvent::Probe(address));
            assert_eq!(self.requests(), vec![DeviceRequest::Identify { address }]);
            self.bridge.handle(BridgeEvent::Identified {
                address,
                result: Ok(Identity {
                    info: info(power),
                    app: Some(ActiveApp { id: None, name: "Roku".to_string(), screensaver: None }),
                }),
            });
        }

        fn mode(&self) -> PollMode {
            self.bridge.registry().get("YN00AB").unwrap().mode
        }
    }

    fn addr() -> IpAddr {
        IpAddr::from([10, 0, 0, 2])
    }

    fn info(power: PowerState) -> DeviceInfo {
        DeviceInfo {
            serial_number: "YN00AB".to_string(),
            user_device_name: Some("Living Room".to_string()),
            friendly_device_name: Some("Roku Ultra".to_string()),
            model_name: Some("4800X".to_string()),
            power_state: power,
            supports_suspend: false,
        }
    }

    fn unreachable() -> BridgeEvent {
        BridgeEvent::Activity {
            serial: "YN00AB".to_string(),
            result: Err(ProbeError::Unreachable("timed out".to_string())),
        }
    }

    #[test]
    fn test_registration_publishes_state() {
        let mut h = Harness::new();
        h.register(PowerState::Ready);

        assert_eq!(
            h.published(),
            vec![
                ("roku/living_room/state".to_string(), "ready".to_string()),
                ("roku/living_room/app".to_string(), "Home".to_string()),
            ]
        );
        assert_eq!(
            h.requests(),
            vec![DeviceRequest::ListApps { serial: "YN00AB".to_string(), address: addr() }]
        );
        assert_eq!(h.mode(), PollMode::Idle);
        assert!(h.bridge.discovery.ledger().is_fresh(&addr(), Instant::now()));
    }

    #[test]
    fn test_unreachable_twice_publishes_off_once() {
        let mut h = Harness::new();
        h.register(PowerState::Ready);
        h.published();
        h.requests();

        assert_eq!(h.fire_probe(), Duration::from_secs(5));
        assert!(matches!(h.requests()[..], [DeviceRequest::ActiveApp { .. }]));
        h.bridge.handle(unreachable());
        assert!(h.published().is_empty());

        assert_eq!(h.fire_probe(), Duration::from_secs(5));
        h.bridge.handle(unreachable());
        assert_eq!(
            h.published(),
            vec![("roku/living_room/state".to_string(), "off".to_string())]
        );
        assert!(!h.bridge.discovery.ledger().contains(&addr()));
        assert!(h.timers().is_empty());

        // a late failure must not publish again
        h.bridge.handle(unreachable());
        assert!(h.published().is_empty());
    }

    #[test]
    fn test_keypress_message_sends_and_activates() {
        let mut h = Harness::new();
        h.register(PowerState::Ready);
        h.requests();
        h.timers();

        h.bridge.handle(BridgeEvent::Message {
            topic: "roku/set/living_room/keypress".to_string(),
            payload: "up up select".to_string(),
        });

        let press = |name| Action::KeyPress { key: Key::Named(name), repeat: 1 };
        assert_eq!(
            h.requests(),
            vec![DeviceRequest::SendKeys {
                serial: "YN00AB".to_string(),
                address: addr(),
                actions: vec![press("Up"), press("Up"), press("Select")],
            }]
        );
        assert_eq!(h.mode(), PollMode::Active);

        let timers = h.timers();
        assert!(timers
            .iter()
            .any(|(d, e)| *d == Duration::from_millis(500) && matches!(e, BridgeEvent::ProbeDue { .. })));
        assert!(timers
            .iter()
            .any(|(d, e)| *d == Duration::from_secs(60) && matches!(e, BridgeEvent::DecayDue { .. })));
    }

    #[test]
    fn test_invalid_keypress_sends_nothing_but_activates() {
        let mut h = Harness::new();
        h.register(PowerState::Ready);
        h.requests();

        h.bridge.handle(BridgeEvent::Message {
            topic: "roku/set/living_room/keypress".to_string(),
            payload: "up sideways".to_string(),
        });
        assert!(h.requests().is_empty());
        assert_eq!(h.mode(), PollMode::Active);
    }

    #[test]
    fn test_app_launch_by_name() {
        let mut h = Harness::new();
        h.register(PowerState::Ready);
        h.requests();
        h.bridge.handle(BridgeEvent::AppsListed {
            serial: "YN00AB".to_string(),
            apps: vec![AppInfo { id: "12".to_string(), name: "Netflix".to_string() }],
        });

        let app = |name: &str| BridgeEvent::Message {
            topic: "roku/set/living_room/app".to_string(),
            payload: name.to_string(),
        };
        h.bridge.handle(app("netflix"));
        assert_eq!(
            h.requests(),
            vec![DeviceRequest::Launch {
                serial: "YN00AB".to_string(),
                address: addr(),
                app_id: "12".to_string(),
            }]
        );

        h.bridge.handle(app("Hulu"));
        assert!(h.requests().is_empty());
        assert_eq!(h.mode(), PollMode::Active);
    }

    #[test]
    fn test_debug_toggle() {
        let mut h = Harness::new();
        h.register(PowerState::Ready);
        let debug = |payload: &str| BridgeEvent::Message {
            topic: "roku/set/living_room/debug".to_string(),
            payload: payload.to_string(),
        };

        h.bridge.handle(debug("on"));
        assert!(h.bridge.registry().get("YN00AB").unwrap().debug);
        h.bridge.handle(debug("maybe"));
        assert!(h.bridge.registry().get("YN00AB").unwrap().debug);
        h.bridge.handle(debug("0"));
        assert!(!h.bridge.registry().get("YN00AB").unwrap().debug);
        assert_eq!(h.mode(), PollMode::Idle);
    }

    #[test]
    fn test_recent_address_is_not_probed_twice() {
        let mut h = Harness::new();
        h.bridge.handle(BridgeEvent::Probe(addr()));
        h.bridge.handle(BridgeEvent::Probe(addr()));
        assert_eq!(h.requests().len(), 1);

        h.bridge.handle(BridgeEvent::Identified {
            address: addr(),
            result: Err(ProbeError::Unreachable("no route".to_string())),
        });
        h.bridge.handle(BridgeEvent::Probe(addr()));
        assert_eq!(h.requests(), vec![DeviceRequest::Identify { address: addr() }]);
        assert_eq!(h.bridge.registry().len(), 0);
    }

    #[test]
    fn test_scan_and_announce_schedule_probes() {
        let mut h = Harness::new();
        h.bridge.handle(BridgeEvent::Message {
            topic: "roku/set/scan".to_string(),
            payload: String::new(),
        });
        assert_eq!(h.timers(), vec![(SCAN_DELAY, BridgeEvent::ScanAll)]);

        h.bridge.handle(BridgeEvent::ScanAll);
        assert_eq!(
            h.timers(),
            vec![
                (Duration::from_millis(50), BridgeEvent::Probe(IpAddr::from([10, 0, 0, 1]))),
                (Duration::from_millis(150), BridgeEvent::Probe(addr())),
            ]
        );
        assert!(h.requests().is_empty());

        h.bridge.handle(BridgeEvent::Message {
            topic: "network/online".to_string(),
            payload: "10.0.0.9".to_string(),
        });
        assert_eq!(
            h.timers(),
            vec![(ANNOUNCE_PROBE_DELAY, BridgeEvent::Probe(IpAddr::from([10, 0, 0, 9])))]
        );
    }

    #[test]
    fn test_home_screen_power_check() {
        let mut h = Harness::new();
        let address = addr();
        h.bridge.handle(BridgeEvent::Identified {
            address,
            result: Ok(Identity {
                info: DeviceInfo { supports_suspend: true, ..info(PowerState::Ready) },
                app: Some(ActiveApp { id: Some("12".to_string()), name: "Netflix".to_string(), screensaver: None }),
            }),
        });
        h.requests();
        h.published();

        h.fire_probe();
        h.requests();
        h.bridge.handle(BridgeEvent::Activity {
            serial: "YN00AB".to_string(),
            result: Ok(ActiveApp { id: None, name: "Roku".to_string(), screensaver: None }),
        });
        assert_eq!(
            h.requests(),
            vec![DeviceRequest::PowerInfo { serial: "YN00AB".to_string(), address }]
        );
        assert_eq!(
            h.published(),
            vec![("roku/living_room/app".to_string(), "Home".to_string())]
        );
        assert_eq!(h.mode(), PollMode::Active);

        h.bridge.handle(BridgeEvent::PowerInfo {
            serial: "YN00AB".to_string(),
            result: Ok(info(PowerState::DisplayOff)),
        });
        assert_eq!(
            h.published(),
            vec![("roku/living_room/state".to_string(), "displayoff".to_string())]
        );
    }
}
