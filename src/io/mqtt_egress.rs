//! MQTT transport for outbound notifications
//!
//! Each notification is published to `{topic}/{kind}`:
//! - `{topic}/item_placed`, `{topic}/item_taken`, `{topic}/system_error` (QoS 1)
//! - `{topic}/proximity_sensor` (QoS 0)

use crate::domain::event::EventKind;
use crate::infra::config::Config;
use crate::services::notification::{run_subscription, Notification, NotificationSink, NotificationTransport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Subscriber id the MQTT forwarder registers with the sink
pub const MQTT_CHANNEL_ID: &str = "mqtt";

pub struct MqttTransport {
    client: AsyncClient,
    topic: String,
    eventloop: JoinHandle<()>,
}

impl MqttTransport {
    /// Create a client for the configured broker
    ///
    /// The connection is driven by a background event loop that keeps
    /// retrying after `reconnect_delay` while the broker is unreachable.
    pub fn new(config: &Config) -> Self {
        let client_id = format!("{}-gateway-{}", config.site_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
        let reconnect_delay = config.reconnect_delay();

        let eventloop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, delay_secs = %reconnect_delay.as_secs(), "mqtt_egress_error");
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        });

        Self { client, topic: config.mqtt_topic().trim_end_matches('/').to_string(), eventloop }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.eventloop.abort();
    }
}

fn topic_for(base: &str, kind: EventKind) -> String {
    format!("{base}/{}", kind.as_str().to_ascii_lowercase())
}

/// Committed inventory changes and errors must arrive; proximity is live telemetry
fn qos_for(kind: EventKind) -> QoS {
    match kind {
        EventKind::ProximitySensor => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[async_trait]
impl NotificationTransport for MqttTransport {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn deliver(&mut self, notification: &Notification) -> anyhow::Result<()> {
        let payload = notification.to_json()?;
        let topic = topic_for(&self.topic, notification.kind);
        self.client
            .publish(&topic, qos_for(notification.kind), false, payload.into_bytes())
            .await?;
        Ok(())
    }
}

/// Forward sink notifications to the broker until shutdown
pub async fn run_mqtt_egress(
    config: Config,
    sink: Arc<NotificationSink>,
    shutdown: watch::Receiver<bool>,
) {
    let transport = MqttTransport::new(&config);
    info!(
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        topic = %config.mqtt_topic(),
        "mqtt_egress_started"
    );
    run_subscription(sink, MQTT_CHANNEL_ID.to_string(), transport, config.reconnect_delay(), shutdown)
        .await;
    info!("mqtt_egress_shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_per_kind() {
        assert_eq!(topic_for("fridge/events", EventKind::ItemPlaced), "fridge/events/item_placed");
        assert_eq!(
            topic_for("fridge/events", EventKind::ProximitySensor),
            "fridge/events/proximity_sensor"
        );
    }

    #[test]
    fn test_qos_per_kind() {
        assert_eq!(qos_for(EventKind::ItemTaken), QoS::AtLeastOnce);
        assert_eq!(qos_for(EventKind::SystemError), QoS::AtLeastOnce);
        assert_eq!(qos_for(EventKind::ProximitySensor), QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_transport_builds_without_broker() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_tests(dir.path());
        let transport = MqttTransport::new(&config);
        assert_eq!(transport.topic, "fridge/events");
        assert_eq!(transport.name(), "mqtt");
    }
}
