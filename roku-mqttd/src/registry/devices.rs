use std::collections::HashMap;
use std::net::IpAddr;
use shared::types::{ActiveApp, AppInfo, DeviceInfo, PowerState};
use crate::slug::slugify;

/// Polling cadence of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Idle,
    Active,
}

/// An installed channel with its slug precomputed for lookups
#[derive(Debug, Clone, PartialEq)]
pub struct KnownApp {
    pub id: String,
    pub slug: String,
    pub name: String,
}

/// A known device, keyed by serial number.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub serial: String,

    /// Last address the device answered on
    pub address: IpAddr,

    pub slug: String,

    pub name: String,

    /// Label of the foreground app, empty until first known
    pub app_state: String,

    pub power: PowerState,

    pub mode: PollMode,

    pub consecutive_unreachable: u32,

    pub consecutive_query_failures: u32,

    /// Installed channels; `None` until the first listing arrives
    pub known_apps: Option<Vec<KnownApp>>,

    pub supports_suspend: bool,

    /// Log raw probe responses for this device
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    New,
    Refreshed,
}

/// All known devices plus address and slug indexes that point back into the table.
#[derive(Debug)]
pub struct Registry {
    devices: HashMap<String, DeviceRecord>,
    by_address: HashMap<IpAddr, String>,
    by_slug: HashMap<String, String>,
    separator: String,
}

impl Registry {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            devices: HashMap::new(),
            by_address: HashMap::new(),
            by_slug: HashMap::new(),
            separator: separator.into(),
        }
    }

    pub fn slugify(&self, name: &str) -> String {
        slugify(name, &self.separator)
    }

    /// Insert or replace the record for a freshly probed device.
    ///
    /// Runtime counters start over; the installed-app list and debug flag of a
    /// previous record survive until replaced.
    pub fn upsert(
        &mut self,
        address: IpAddr,
        info: &DeviceInfo,
        app: Option<&ActiveApp>,
        debug: bool,
    ) -> Upsert {
        let serial = info.serial_number.clone();
        let mut slug = self.slugify(info.display_name());
        if slug.is_empty() {
            slug = serial.to_lowercase();
        }

        let previous = self.devices.remove(&serial);
        if let Some(old) = &previous {
            if old.address != address && self.by_address.get(&old.address) == Some(&serial) {
                self.by_address.remove(&old.address);
            }
            if old.slug != slug && self.by_slug.get(&old.slug) == Some(&serial) {
                self.by_slug.remove(&old.slug);
            }
        }

        if let Some(other) = self.find_by_address(&address).filter(|other| other.serial != serial) {
            tracing::warn!(
                "Address {} moves from device {} ({}) to device {}",
                address,
                other.serial,
                other.slug,
                serial
            );
        }

        if let Some(other) = self.by_slug.get(&slug).filter(|other| **other != serial) {
            tracing::warn!(
                "Slug {} moves from device {} to device {}",
                slug,
                other,
                serial
            );
        }

        let record = DeviceRecord {
            serial: serial.clone(),
            address,
            slug: slug.clone(),
            name: info.display_name().to_string(),
            app_state: app.map(ActiveApp::label).unwrap_or_default(),
            power: info.power_state.clone(),
            mode: PollMode::Idle,
            consecutive_unreachable: 0,
            consecutive_query_failures: 0,
            known_apps: previous.as_ref().and_then(|old| old.known_apps.clone()),
            supports_suspend: info.supports_suspend,
            debug: previous.as_ref().map_or(debug, |old| old.debug),
        };

        self.by_address.insert(address, serial.clone());
        self.by_slug.insert(slug, serial.clone());
        self.devices.insert(serial, record);

        if previous.is_some() {
            Upsert::Refreshed
        } else {
            Upsert::New
        }
    }

    pub fn get(&self, serial: &str) -> Option<&DeviceRecord> {
        self.devices.get(serial)
    }

    pub fn get_mut(&mut self, serial: &str) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(serial)
    }

    /// Case-insensitive lookup of a topic segment
    pub fn find_by_slug_token(&self, token: &str) -> Option<&DeviceRecord> {
        self.by_slug
            .get(&token.to_lowercase())
            .and_then(|serial| self.devices.get(serial))
    }

    #[cfg(test)]
    pub fn is_slug(&self, token: &str) -> bool {
        self.find_by_slug_token(token).is_some()
    }

    pub fn find_by_address(&self, address: &IpAddr) -> Option<&DeviceRecord> {
        self.by_address
            .get(address)
            .and_then(|serial| self.devices.get(serial))
    }

    pub fn set_apps(&mut self, serial: &str, apps: Vec<AppInfo>) {
        let separator = self.separator.clone();
        if let Some(record) = self.devices.get_mut(serial) {
            record.known_apps = Some(
                apps.into_iter()
                    .map(|app| KnownApp {
                        slug: slugify(&app.name, &separator),
                        id: app.id,
                        name: app.name,
                    })
                    .collect(),
            );
        }
    }

    /// Resolve an app name to its id among the device's installed channels
    pub fn find_app_by_slug(&self, serial: &str, app_name: &str) -> Option<&KnownApp> {
        let slug = self.slugify(app_name);
        self.devices
            .get(serial)?
            .known_apps
            .as_ref()?
            .iter()
            .find(|app| app.slug == slug)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }
}
