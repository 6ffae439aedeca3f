use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::types::{ActiveApp, DeviceInfo};
use crate::bridge::BridgeEvent;
use crate::command::Action;
use crate::discovery::ssdp;
use super::EcpClient;

/// Network work requested by the bridge; each result comes back as a `BridgeEvent`
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRequest {
    /// Identity probe of an address that may or may not be a device
    Identify { address: IpAddr },
    ActiveApp { serial: String, address: IpAddr },
    PowerInfo { serial: String, address: IpAddr },
    ListApps { serial: String, address: IpAddr },
    SendKeys { serial: String, address: IpAddr, actions: Vec<Action> },
    Launch { serial: String, address: IpAddr, app_id: String },
    /// Broadcast SSDP search
    Search,
}

/// Result of a successful identity probe
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub info: DeviceInfo,
    /// Foreground app at registration, if it could be read
    pub app: Option<ActiveApp>,
}

/// Worker loop - runs every request as its own task so probes interleave
pub async fn run(
    client: EcpClient,
    mut rx: mpsc::UnboundedReceiver<DeviceRequest>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let client = Arc::new(client);

    loop {
        tokio::select! {
            Some(request) = rx.recv() => {
                let client = Arc::clone(&client);
                let events = events.clone();
                tokio::spawn(async move {
                    execute(&client, request, &events).await;
                });
            }
            _ = cancel.cancelled() => {
                tracing::info!("Device worker shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn execute(client: &EcpClient, request: DeviceRequest, events: &mpsc::UnboundedSender<BridgeEvent>) {
    let event = match request {
        DeviceRequest::Identify { address } => {
            let result = match client.device_info(address).await {
                Ok(info) => {
                    let app = match client.active_app(address).await {
                        Ok(app) => Some(app),
                        Err(e) => {
                            tracing::warn!("{}: active app query failed: {}", address, e);
                            None
                        }
                    };
                    Ok(Identity { info, app })
                }
                Err(e) => Err(e),
            };
            BridgeEvent::Identified { address, result }
        }
        DeviceRequest::ActiveApp { serial, address } => BridgeEvent::Activity {
            serial,
            result: client.active_app(address).await,
        },
        DeviceRequest::PowerInfo { serial, address } => BridgeEvent::PowerInfo {
            serial,
            result: client.device_info(address).await,
        },
        DeviceRequest::ListApps { serial, address } => match client.apps(address).await {
            Ok(apps) => BridgeEvent::AppsListed { serial, apps },
            Err(e) => {
                tracing::warn!("{}({}): app list failed: {}", serial, address, e);
                return;
            }
        },
        DeviceRequest::SendKeys { serial, address, actions } => BridgeEvent::CommandSent {
            serial,
            command: "keypress",
            result: client.send_actions(address, &actions).await,
        },
        DeviceRequest::Launch { serial, address, app_id } => BridgeEvent::CommandSent {
            serial,
            command: "launch",
            result: client.launch(address, &app_id).await,
        },
        DeviceRequest::Search => {
            if let Err(e) = ssdp::search(events).await {
                tracing::warn!("SSDP search failed: {:#}", e);
            }
            return;
        }
    };

    if events.send(event).is_err() {
        tracing::debug!("Bridge closed, dropping device result");
    }
}
