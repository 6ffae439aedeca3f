//! Inbound message routing.

use std::net::IpAddr;
use crate::config::Config;
use crate::registry::Registry;
use super::topic::TopicPattern;

/// Command addressed to one device through a set or send topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Active,
    Debug,
    Keypress,
    Text,
    App,
}

impl DeviceAction {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "active" => Some(Self::Active),
            "debug" => Some(Self::Debug),
            "keypress" => Some(Self::Keypress),
            "text" => Some(Self::Text),
            "app" => Some(Self::App),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Our own keepalive
    Ping,
    /// Rescan every configured range
    Scan,
    Command {
        serial: String,
        action: DeviceAction,
        payload: String,
    },
    /// A device may have come online at this address
    Announce(IpAddr),
    /// Logged and discarded
    Dropped,
}

pub struct Dispatcher {
    ping_topic: String,
    set: Option<TopicPattern>,
    send: Option<TopicPattern>,
    announce: Option<TopicPattern>,
    announce_attribute: Option<String>,
}

fn pattern(template: Option<&str>) -> Result<Option<TopicPattern>, regex::Error> {
    template.map(TopicPattern::new).transpose()
}

impl Dispatcher {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            ping_topic: config.mqtt.ping_topic.clone(),
            set: pattern(config.roku_set_topic.as_deref())?,
            send: pattern(config.roku_send_topic.as_deref())?,
            announce: pattern(config.new_roku_topic.as_deref())?,
            announce_attribute: config.new_roku_attribute.clone(),
        })
    }

    pub fn route(&self, registry: &Registry, topic: &str, payload: &str) -> Route {
        let matches = |p: &Option<TopicPattern>| p.as_ref().is_some_and(|p| p.matches(topic));

        if topic == self.ping_topic {
            Route::Ping
        } else if matches(&self.set) || matches(&self.send) {
            self.route_command(registry, topic, payload)
        } else if matches(&self.announce) {
            self.route_announce(topic, payload)
        } else {
            tracing::warn!("Unexpected message: {} : {}", topic, payload);
            Route::Dropped
        }
    }

    fn route_command(&self, registry: &Registry, topic: &str, payload: &str) -> Route {
        let mut serial = None;
        let mut keyword = None;

        for segment in topic.split('/').map(str::to_lowercase) {
            match registry.find_by_slug_token(&segment) {
                Some(record) => serial = Some(record.serial.clone()),
                None => keyword = Some(segment),
            }
        }
        let keyword = keyword.unwrap_or_default();

        if keyword == "scan" {
            return Route::Scan;
        }
        let Some(serial) = serial else {
            tracing::warn!("Unexpected set message topic: {} payload: {}", topic, payload);
            return Route::Dropped;
        };
        match DeviceAction::from_keyword(&keyword) {
            Some(action) => Route::Command {
                serial,
                action,
                payload: payload.to_string(),
            },
            None => {
                tracing::warn!("Unknown action \"{}\" in topic {}", keyword, topic);
                Route::Dropped
            }
        }
    }

    fn route_announce(&self, topic: &str, payload: &str) -> Route {
        let address = match &self.announce_attribute {
            Some(attribute) => {
                let message: serde_json::Value = match serde_json::from_str(payload) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("Badly formed message on {}: {} ({})", topic, payload, e);
                        return Route::Dropped;
                    }
                };
                tracing::trace!("{}: {}", topic, message);
                match message.get(attribute).and_then(|v| v.as_str()) {
                    Some(address) => address.trim().to_string(),
                    None => {
                        tracing::warn!("Message on {} has no \"{}\" field", topic, attribute);
                        return Route::Dropped;
                    }
                }
            }
            None => payload.trim().to_string(),
        };

        match address.parse() {
            Ok(address) => Route::Announce(address),
            Err(_) => {
                tracing::warn!("Announced address is not an IP address: {}", address);
                Route::Dropped
            }
        }
    }
}
