use serde::Deserialize;
use shared::types::{ActiveApp, AppInfo, DeviceInfo, PowerState};
use super::ProbeError;

/// `query/device-info` response
///
/// ```xml
/// <device-info>
///   <serial-number>X004000ABCDE</serial-number>
///   <user-device-name>Living Room</user-device-name>
///   <power-mode>PowerOn</power-mode>
///   <supports-suspend>true</supports-suspend>
/// </device-info>
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeviceInfoXml {
    serial_number: String,
    #[serde(default)]
    user_device_name: Option<String>,
    #[serde(default)]
    friendly_device_name: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    power_mode: Option<String>,
    #[serde(default)]
    supports_suspend: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActiveAppXml {
    app: AppXml,
    #[serde(default)]
    screensaver: Option<AppXml>,
}

#[derive(Debug, Deserialize)]
struct AppXml {
    #[serde(rename = "@id", default)]
    id: Option<String>,
    #[serde(rename = "$text", default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct AppsXml {
    #[serde(rename = "app", default)]
    apps: Vec<AppXml>,
}

fn parse_error(what: &str, e: quick_xml::DeError) -> ProbeError {
    ProbeError::Other(format!("Failed to parse {}: {}", what, e))
}

pub fn parse_device_info(xml: &str) -> Result<DeviceInfo, ProbeError> {
    let raw: DeviceInfoXml =
        quick_xml::de::from_str(xml).map_err(|e| parse_error("device-info", e))?;

    Ok(DeviceInfo {
        serial_number: raw.serial_number.trim().to_string(),
        user_device_name: raw.user_device_name,
        friendly_device_name: raw.friendly_device_name,
        model_name: raw.model_name,
        // devices without power modes are on whenever they answer
        power_state: raw
            .power_mode
            .as_deref()
            .map_or(PowerState::On, PowerState::from_wire),
        supports_suspend: raw
            .supports_suspend
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("true")),
    })
}

pub fn parse_active_app(xml: &str) -> Result<ActiveApp, ProbeError> {
    let raw: ActiveAppXml =
        quick_xml::de::from_str(xml).map_err(|e| parse_error("active-app", e))?;

    Ok(ActiveApp {
        id: raw.app.id,
        name: raw.app.name.trim().to_string(),
        screensaver: raw.screensaver.map(|saver| saver.name.trim().to_string()),
    })
}

pub fn parse_apps(xml: &str) -> Result<Vec<AppInfo>, ProbeError> {
    let raw: AppsXml = quick_xml::de::from_str(xml).map_err(|e| parse_error("apps", e))?;

    Ok(raw
        .apps
        .into_iter()
        .filter_map(|app| {
            Some(AppInfo {
                id: app.id?,
                name: app.name.trim().to_string(),
            })
        })
        .collect())
}
