use std::error::Error as _;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use anyhow::{Context, Result};
use shared::protocol::ECP_PORT;
use shared::types::{ActiveApp, AppInfo, DeviceInfo};
use crate::command::{Action, Key};
use super::{xml, ProbeError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the ECP API of any device on the network
#[derive(Clone)]
pub struct EcpClient {
    http: reqwest::Client,
    port: u16,
}

impl EcpClient {
    pub fn new() -> Result<Self> {
        Self::build(ECP_PORT, REQUEST_TIMEOUT)
    }

    fn build(port: u16, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            // devices are on the local network
            .no_proxy()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, port })
    }

    fn url(&self, address: IpAddr, path: &str) -> String {
        format!("http://{}/{}", SocketAddr::new(address, self.port), path)
    }

    async fn get(&self, address: IpAddr, path: &str) -> Result<String, ProbeError> {
        let body = self
            .http
            .get(self.url(address, path))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(classify)?
            .text()
            .await
            .map_err(classify)?;
        tracing::trace!("{} {}: {}", address, path, body);
        Ok(body)
    }

    async fn post(&self, address: IpAddr, path: &str) -> Result<(), ProbeError> {
        self.http
            .post(self.url(address, path))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(classify)?;
        Ok(())
    }

    pub async fn device_info(&self, address: IpAddr) -> Result<DeviceInfo, ProbeError> {
        xml::parse_device_info(&self.get(address, "query/device-info").await?)
    }

    pub async fn active_app(&self, address: IpAddr) -> Result<ActiveApp, ProbeError> {
        xml::parse_active_app(&self.get(address, "query/active-app").await?)
    }

    pub async fn apps(&self, address: IpAddr) -> Result<Vec<AppInfo>, ProbeError> {
        xml::parse_apps(&self.get(address, "query/apps").await?)
    }

    pub async fn keypress(&self, address: IpAddr, key: Key) -> Result<(), ProbeError> {
        self.post(address, &format!("keypress/{}", key.wire_code())).await
    }

    pub async fn launch(&self, address: IpAddr, app_id: &str) -> Result<(), ProbeError> {
        self.post(address, &format!("launch/{}", urlencoding::encode(app_id))).await
    }

    /// Play an action list in order, stopping at the first failed key press
    pub async fn send_actions(&self, address: IpAddr, actions: &[Action]) -> Result<(), ProbeError> {
        for action in actions {
            match action {
                Action::KeyPress { key, repeat } => {
                    for _ in 0..*repeat {
                        self.keypress(address, *key).await?;
                    }
                }
                Action::Wait { duration } => tokio::time::sleep(*duration).await,
            }
        }
        Ok(())
    }
}

/// Timeouts and missing routes mean nothing is there; anything else answered
fn classify(err: reqwest::Error) -> ProbeError {
    if err.is_timeout() || (err.is_connect() && no_route(&err)) {
        ProbeError::Unreachable(err.to_string())
    } else {
        ProbeError::Other(err.to_string())
    }
}

fn no_route(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable | ErrorKind::TimedOut
            );
        }
        source = cause.source();
    }
    false
}
