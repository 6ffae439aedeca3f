//! Broadcast discovery of devices that answer `roku:ecp` M-SEARCH requests.

use std::net::IpAddr;
use std::time::Duration;
use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use shared::protocol::{SSDP_MULTICAST_ADDR, SSDP_SEARCH_TARGET};
use crate::bridge::BridgeEvent;

/// How long each search listens for answers
pub const LISTEN_WINDOW: Duration = Duration::from_secs(3);

/// The search is sent again this long after the first one
pub const REPEAT_AFTER: Duration = Duration::from_secs(10);

/// Answer to an M-SEARCH
#[derive(Debug, Clone, PartialEq)]
pub struct SsdpResponse {
    pub search_target: String,
    pub location: Option<String>,
    pub usn: Option<String>,
}

fn search_request() -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {}\r\n\
         \r\n",
        SSDP_MULTICAST_ADDR, SSDP_SEARCH_TARGET
    )
}

/// Run two search rounds, reporting every responder as `BridgeEvent::Discovered`.
pub async fn search(events: &mpsc::UnboundedSender<BridgeEvent>) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("Failed to bind SSDP socket")?;
    let request = search_request();

    let started = Instant::now();
    for round in 0..2 {
        if round > 0 {
            tokio::time::sleep_until(started + REPEAT_AFTER).await;
        }
        socket
            .send_to(request.as_bytes(), SSDP_MULTICAST_ADDR)
            .await
            .context("Failed to send M-SEARCH")?;
        tracing::debug!("SSDP search sent (round {})", round + 1);

        let found = listen(&socket, events).await?;
        tracing::debug!("SSDP round {} got {} answer(s)", round + 1, found);
    }

    Ok(())
}

async fn listen(socket: &UdpSocket, events: &mpsc::UnboundedSender<BridgeEvent>) -> Result<usize> {
    let deadline = Instant::now() + LISTEN_WINDOW;
    let mut buffer = [0u8; 2048];
    let mut found = 0;

    loop {
        let (size, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
            Err(_) => break,
            Ok(received) => received.context("SSDP socket error")?,
        };

        let Ok(text) = std::str::from_utf8(&buffer[..size]) else {
            continue;
        };
        match parse_ssdp_response(text) {
            Some(response) if is_roku(&response) => {
                found += 1;
                let address = location_address(&response).unwrap_or_else(|| from.ip());
                tracing::debug!("SSDP answer from {} ({})", address, response.usn.as_deref().unwrap_or("-"));
                if events.send(BridgeEvent::Discovered(address)).is_err() {
                    break;
                }
            }
            Some(response) => {
                tracing::trace!("Ignoring SSDP answer from {} for {}", from, response.search_target);
            }
            None => {}
        }
    }

    Ok(found)
}

fn is_roku(response: &SsdpResponse) -> bool {
    response.search_target.eq_ignore_ascii_case(SSDP_SEARCH_TARGET)
}

/// Address a responder advertised in its LOCATION header
fn location_address(response: &SsdpResponse) -> Option<IpAddr> {
    let location = response.location.as_deref()?;
    let rest = location.split_once("://").map_or(location, |(_, rest)| rest);
    let host_port = rest.split('/').next()?;
    let host = host_port.rsplit_once(':').map_or(host_port, |(host, _)| host);
    host.parse().ok()
}

fn parse_ssdp_response(response: &str) -> Option<SsdpResponse> {
    let mut search_target = None;
    let mut location = None;
    let mut usn = None;

    for line in response.lines() {
        let line = line.trim();

        if let Some(value) = extract_header_value(line, "ST:") {
            search_target = Some(value);
        } else if let Some(value) = extract_header_value(line, "LOCATION:") {
            location = Some(value);
        } else if let Some(value) = extract_header_value(line, "USN:") {
            usn = Some(value);
        }
    }

    search_target.map(|search_target| SsdpResponse {
        search_target,
        location,
        usn,
    })
}

fn extract_header_value(line: &str, header: &str) -> Option<String> {
    let name = line.get(..header.len())?;
    let value = line.get(header.len()..)?;
    if !value.is_empty() && name.eq_ignore_ascii_case(header) {
        Some(value.trim().to_string())
    } else {
        None
    }
}
