//! MQTT transport adapter
//!
//! Subscribes to datapoint topics and feeds every publish into the ingestion
//! pipeline. Messages are handled in arrival order on the polling task.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::state::AppState;

/// Build client options from configuration
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }
    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Poll the broker forever. Connection errors are logged and polling resumes
/// after the configured delay; the client reconnects on the next poll.
pub async fn run(state: Arc<AppState>, config: MqttConfig) {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 10);
    let reconnect_delay = Duration::from_secs(config.reconnect_delay_secs);

    info!(
        host = %config.host,
        port = config.port,
        tls = config.tls,
        filter = %config.topic_filter,
        "Starting MQTT client"
    );

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(host = %config.host, "MQTT connected");
                // Subscriptions do not survive a clean-session reconnect
                if let Err(e) = client.try_subscribe(&config.topic_filter, QoS::AtMostOnce) {
                    error!(filter = %config.topic_filter, error = %e, "MQTT subscribe failed");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!(pkid = ack.pkid, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                state.handle_message(&publish.topic, &publish.payload).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_secs = reconnect_delay.as_secs(),
                    "MQTT connection error"
                );
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}
