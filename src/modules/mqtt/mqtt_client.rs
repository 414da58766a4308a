//! MQTT transport backed by `rumqttc`
//!
//! The event loop runs on its own task. It re-subscribes after every
//! `ConnAck` (sessions are clean) and backs off exponentially while the broker
//! is unreachable.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Subscription, Transport};
use crate::core::config::MqttConfig;
use crate::core::error::{AppError, Result};
use crate::features::ingestion::models::InboundMessage;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How long a clean disconnect may take on shutdown
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of rumqttc's internal request queue
const REQUEST_CAPACITY: usize = 64;

pub struct MqttTransport {
    options: MqttOptions,
    qos: QoS,
    channel_capacity: usize,
    broker: String,
}

impl MqttTransport {
    pub fn new(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_credentials(&config.username, &config.password);
        options.set_clean_session(true);
        if config.use_tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        Self {
            options,
            qos: qos_from_level(config.qos),
            channel_capacity: config.channel_capacity,
            broker: config.broker_address(),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(
        self,
        topic_filter: &str,
        shutdown: CancellationToken,
    ) -> Result<Subscription> {
        if !rumqttc::valid_filter(topic_filter) {
            return Err(AppError::Transport(format!(
                "Invalid MQTT topic filter: '{}'",
                topic_filter
            )));
        }

        let (client, eventloop) = AsyncClient::new(self.options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(self.channel_capacity);

        info!(
            "Connecting to MQTT broker {} (topic filter: {}, qos: {:?})",
            self.broker, topic_filter, self.qos
        );

        let session = EventLoopSession {
            client,
            eventloop,
            topic_filter: topic_filter.to_string(),
            qos: self.qos,
            broker: self.broker,
            deliver: tx,
            shutdown,
        };
        let task = tokio::spawn(session.run());

        Ok(Subscription::new(rx, task))
    }
}

struct EventLoopSession {
    client: AsyncClient,
    eventloop: EventLoop,
    topic_filter: String,
    qos: QoS,
    broker: String,
    deliver: mpsc::Sender<InboundMessage>,
    shutdown: CancellationToken,
}

impl EventLoopSession {
    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("MQTT connected to {} ({:?})", self.broker, ack.code);
                    backoff = INITIAL_BACKOFF;
                    if let Err(e) = self.client.try_subscribe(self.topic_filter.as_str(), self.qos) {
                        error!("Failed to request MQTT subscription: {}", e);
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!("MQTT subscription acknowledged: {:?}", ack.return_codes);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        sent = self.deliver.send(message) => {
                            if sent.is_err() {
                                debug!("Ingestion queue closed, stopping MQTT event loop");
                                break;
                            }
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("MQTT broker {} sent disconnect", self.broker);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT disconnected from {}: {}", self.broker, e);
                    info!("MQTT reconnecting in {:?}", backoff);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        self.disconnect().await;
    }

    async fn disconnect(mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to request MQTT disconnect: {}", e);
            return;
        }

        let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("MQTT disconnect did not complete within {:?}", DISCONNECT_TIMEOUT);
        }
        info!("MQTT transport stopped");
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqttConfig {
        MqttConfig {
            host: "localhost".to_string(),
            port: 1883,
            use_tls: false,
            username: "bridge".to_string(),
            password: "secret".to_string(),
            topic_filter: "sensor/#".to_string(),
            client_id: "bridge-test".to_string(),
            keep_alive: Duration::from_secs(30),
            qos: 1,
            channel_capacity: 8,
        }
    }

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[test]
    fn test_options_from_config() {
        let transport = MqttTransport::new(&config());
        assert_eq!(transport.options.client_id(), "bridge-test");
        assert_eq!(transport.options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(transport.options.keep_alive(), Duration::from_secs(30));
        assert_eq!(transport.broker, "mqtt://localhost:1883");
    }

    #[tokio::test]
    async fn test_rejects_invalid_topic_filter() {
        let transport = MqttTransport::new(&config());
        let result = transport
            .subscribe("sensor/#/temp", CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::Transport(_))));
    }
}
