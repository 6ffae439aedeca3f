use std::time::Duration;
use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS, Transport};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use crate::bridge::BridgeEvent;
use crate::config::{Config, MqttConfig};
use super::Publication;

/// Interval between keepalive pings on the ping topic
pub const PING_INTERVAL: Duration = Duration::from_secs(60);

/// How often the inactivity watchdog looks at the last message time
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

/// Silence on the bus longer than this ends the process
pub const MAX_SILENCE: Duration = Duration::from_secs(90);

/// Time allowed to flush the final `stop` on shutdown
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no bus traffic for {0:?}")]
    Inactive(Duration),
    #[error("bus connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("bus client closed")]
    Closed,
}

impl BusError {
    /// Process exit status; the supervisor restarts us either way
    pub fn exit_code(&self) -> i32 {
        match self {
            BusError::Inactive(_) => 10,
            BusError::Connection(_) | BusError::Closed => 1,
        }
    }
}

fn client_id(mqtt: &MqttConfig) -> anyhow::Result<String> {
    if let Some(id) = &mqtt.client_id {
        return Ok(id.clone());
    }
    let host = hostname::get().context("Failed to read hostname")?;
    Ok(format!("roku-mqtt-{}", host.to_string_lossy()))
}

/// Broker connection options: credentials, TLS, keepalive and the `stop` will
pub fn mqtt_options(config: &Config) -> anyhow::Result<MqttOptions> {
    let mqtt = &config.mqtt;
    let mut options = MqttOptions::new(client_id(mqtt)?, &mqtt.host, mqtt.port());
    options.set_keep_alive(Duration::from_secs(mqtt.keepalive.max(5)));

    if let Some(username) = &mqtt.username {
        options.set_credentials(username, mqtt.password.as_deref().unwrap_or_default());
    }
    if let Some(cafile) = &mqtt.cafile {
        let ca = std::fs::read(cafile)
            .with_context(|| format!("Failed to read CA file: {}", cafile.display()))?;
        options.set_transport(Transport::tls(ca, None, None));
    }
    if let Some(status) = &config.status_topic {
        options.set_last_will(LastWill::new(status, "stop", QoS::AtMostOnce, false));
    }

    Ok(options)
}

/// Topics to subscribe to after every connection acknowledgement
pub fn subscriptions(config: &Config) -> Vec<String> {
    let mut topics = Vec::new();
    if let Some(topic) = &config.new_roku_topic {
        topics.push(topic.clone());
    }
    for topic in [&config.roku_set_topic, &config.roku_send_topic].into_iter().flatten() {
        topics.push(format!("{}/+", topic));
    }
    topics.push(config.mqtt.ping_topic.clone());
    topics
}

fn ping_payload() -> String {
    serde_json::json!({ "timestamp": chrono::Utc::now().to_rfc3339() }).to_string()
}

/// Drive the broker connection until shutdown or a fatal error.
///
/// Inbound publishes go to the bridge as `BridgeEvent::Message`; outbound
/// `Publication`s are sent by a separate task so a full request queue never
/// stalls the event loop.
pub async fn run(
    config: Config,
    events: mpsc::UnboundedSender<BridgeEvent>,
    outbound: mpsc::UnboundedReceiver<Publication>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let options = mqtt_options(&config)?;
    tracing::info!("Connecting to MQTT broker {}:{}", config.mqtt.host, config.mqtt.port());

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let publisher = tokio::spawn(publish_loop(client.clone(), outbound));

    let result = event_loop(&config, &client, &mut eventloop, &events, &cancel).await;
    publisher.abort();

    if result.is_ok() {
        shutdown(&config, &client, &mut eventloop).await;
    }
    result.map_err(Into::into)
}

async fn event_loop(
    config: &Config,
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    events: &mpsc::UnboundedSender<BridgeEvent>,
    cancel: &CancellationToken,
) -> Result<(), BusError> {
    let mut last_activity = Instant::now();
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut watchdog = interval_at(Instant::now() + WATCHDOG_INTERVAL, WATCHDOG_INTERVAL);

    loop {
        tokio::select! {
            notification = eventloop.poll() => {
                match notification? {
                    Event::Incoming(Packet::ConnAck(_)) => {
                        tracing::info!("Connected to MQTT broker");
                        on_connect(config, client);
                    }
                    Event::Incoming(Packet::Publish(publish)) => {
                        last_activity = Instant::now();
                        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                        tracing::trace!("Topic: {} Payload: {}", publish.topic, payload);
                        let message = BridgeEvent::Message { topic: publish.topic, payload };
                        if events.send(message).is_err() {
                            return Err(BusError::Closed);
                        }
                    }
                    Event::Incoming(Packet::Disconnect) => {
                        tracing::warn!("MQTT connection closed by broker");
                        return Err(BusError::Closed);
                    }
                    _ => {}
                }
            }
            _ = ping.tick() => {
                if let Err(e) = client.try_publish(&config.mqtt.ping_topic, QoS::AtMostOnce, false, ping_payload()) {
                    tracing::warn!("Ping publish failed: {}", e);
                }
            }
            _ = watchdog.tick() => {
                let silent = last_activity.elapsed();
                if silent >= MAX_SILENCE {
                    tracing::warn!("Exit due to MQTT inactivity");
                    return Err(BusError::Inactive(silent));
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("MQTT client shutting down");
                return Ok(());
            }
        }
    }
}

fn on_connect(config: &Config, client: &AsyncClient) {
    for topic in subscriptions(config) {
        tracing::debug!("Subscribing to {}", topic);
        if let Err(e) = client.try_subscribe(&topic, QoS::AtMostOnce) {
            tracing::error!("Subscribe to {} failed: {}", topic, e);
        }
    }
    if let Some(status) = &config.status_topic {
        if let Err(e) = client.try_publish(status, QoS::AtMostOnce, false, "start") {
            tracing::warn!("Status publish failed: {}", e);
        }
    }
}

async fn publish_loop(client: AsyncClient, mut outbound: mpsc::UnboundedReceiver<Publication>) {
    while let Some(publication) = outbound.recv().await {
        tracing::debug!("Publish {} {}", publication.topic, publication.payload);
        if let Err(e) = client
            .publish(publication.topic, QoS::AtMostOnce, false, publication.payload)
            .await
        {
            tracing::error!("Publish failed: {}", e);
            break;
        }
    }
}

/// Announce `stop`, disconnect, and give the event loop a moment to flush
async fn shutdown(config: &Config, client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Some(status) = &config.status_topic {
        let _ = client.try_publish(status, QoS::AtMostOnce, false, "stop");
    }
    let _ = client.try_disconnect();

    let flush = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_FLUSH, flush).await.is_err() {
        tracing::debug!("MQTT flush timed out");
    }
}
