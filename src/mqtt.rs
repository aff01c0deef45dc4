//! Broker subscription loop feeding the ingest [`Pipeline`].

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use crate::config::MqttSettings;
use crate::decoders::ProtocolFamily;
use crate::ingest::Pipeline;

// ---

/// Pause before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Shortest keep-alive sent to the broker.
const MIN_KEEPALIVE_SECS: u64 = 5;

/// Bound of the request channel between client handle and event loop.
const REQUEST_CAPACITY: usize = 64;

/// `<prefix><8 hex chars>`, unique per process.
pub fn client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &suffix[..8])
}

pub fn mqtt_options(settings: &MqttSettings) -> MqttOptions {
    // ---
    let mut options = MqttOptions::new(client_id(&settings.client_prefix), &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(settings.keepalive_secs.max(MIN_KEEPALIVE_SECS)));
    options.set_clean_session(true);

    // A username alone is sent with an empty password
    if let Some(user) = &settings.user {
        options.set_credentials(user, settings.pass.as_deref().unwrap_or_default());
    }
    options
}

/// Subscribe to every family topic.
async fn subscribe_all(client: &AsyncClient) {
    // ---
    for family in ProtocolFamily::ALL {
        match client.subscribe(family.topic(), QoS::AtMostOnce).await {
            Ok(()) => info!(topic = family.topic(), "subscribed"),
            Err(e) => error!(topic = family.topic(), error = %e, "failed to subscribe"),
        }
    }
}

/// Drive the MQTT event loop forever.
///
/// Subscriptions are re-issued on every ConnAck, so a reconnect after a
/// broker restart resumes delivery. Each publish is handled in its own task;
/// nothing here waits for reconciliation to finish.
pub async fn run(settings: MqttSettings, pipeline: Arc<Pipeline>) {
    // ---
    let options = mqtt_options(&settings);
    info!(
        host = %settings.host,
        port = settings.port,
        client_id = %options.client_id(),
        "connecting to MQTT broker"
    );
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    pipeline.handle_message(&publish.topic, &publish.payload).await;
                });
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to MQTT broker");
                subscribe_all(&client).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("MQTT broker sent disconnect");
            }
            Ok(event) => {
                trace!(?event, "mqtt event");
            }
            Err(e) => {
                error!(error = %e, "MQTT connection error, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn settings() -> MqttSettings {
        MqttSettings {
            host: "broker.local".to_string(),
            port: 1884,
            user: Some("ingest".to_string()),
            pass: None,
            client_prefix: "beaconflow_".to_string(),
            keepalive_secs: 1,
        }
    }

    #[test]
    fn test_client_id_has_prefix_and_random_suffix() {
        // ---
        let a = client_id("beaconflow_");
        let b = client_id("beaconflow_");

        assert!(a.starts_with("beaconflow_"));
        assert_eq!(a.len(), "beaconflow_".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_options_from_settings() {
        // ---
        let options = mqtt_options(&settings());

        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(MIN_KEEPALIVE_SECS));
        assert_eq!(
            options.credentials(),
            Some(("ingest".to_string(), String::new()))
        );
        assert!(options.client_id().starts_with("beaconflow_"));
    }

    #[test]
    fn test_no_credentials_without_user() {
        // ---
        let mut s = settings();
        s.user = None;
        s.pass = Some("ignored".to_string());

        assert_eq!(mqtt_options(&s).credentials(), None);
    }
}
