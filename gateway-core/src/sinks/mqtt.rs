//! MQTT sink: publishes decoded readings either as one JSON payload per
//! poll or as individually retained per-variable topics, publishes
//! Home-Assistant discovery payloads for eligible entries, and exposes a
//! write topic that feeds back into the owning transport's bridge.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{GatewayError, Result};
use crate::sinks::{DeviceInfo, Reading};
use crate::spec::types::{RegistryMapEntry, RegistryType, WriteMode};

pub struct MqttSink {
    client: AsyncClient,
    eventloop: Option<EventLoop>,
    base_topic: String,
    single_json_payload: bool,
    max_precision: Option<u32>,
    /// (variable_name, new value as sent by a subscriber on
    /// `<base>/write/<variable>`).
    writes_tx: mpsc::UnboundedSender<(String, String)>,
    writes_rx: mpsc::UnboundedReceiver<(String, String)>,
}

impl MqttSink {
    pub fn new(
        host: &str,
        port: u16,
        client_id: &str,
        base_topic: String,
        single_json_payload: bool,
        max_precision: Option<u32>,
    ) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 64);
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        Self {
            client,
            eventloop: Some(eventloop),
            base_topic,
            single_json_payload,
            max_precision,
            writes_tx,
            writes_rx,
        }
    }

    /// A sender clone to pass into [`Self::run_event_loop`] when it's
    /// spawned as its own task, since the event loop is moved out via
    /// [`Self::take_eventloop`] and can no longer reach `self.writes_tx`.
    pub fn writes_sender(&self) -> mpsc::UnboundedSender<(String, String)> {
        self.writes_tx.clone()
    }

    /// Drains the MQTT event loop, forwarding incoming publishes on
    /// `<base>/write/<variable>` topics into the returned channel. Meant
    /// to run as a background task for the lifetime of the sink; a dual
    /// reconnect strategy is implemented by the caller alternating between
    /// calling this (which lets rumqttc's internal `reconnect()` retry
    /// transient drops) and, after repeated failures, rebuilding the
    /// `MqttSink` entirely for a full reconnect cycle.
    pub async fn run_event_loop(mut eventloop: EventLoop, writes_tx: mpsc::UnboundedSender<(String, String)>) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(variable) = publish.topic.rsplit('/').next() {
                        if publish.topic.contains("/write/") {
                            let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                            let _ = writes_tx.send((variable.to_string(), payload));
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "MQTT event loop error, rumqttc will attempt to reconnect");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub fn take_eventloop(&mut self) -> Option<EventLoop> {
        self.eventloop.take()
    }

    pub fn next_write(&mut self) -> Option<(String, String)> {
        self.writes_rx.try_recv().ok()
    }

    /// Subscribe to the write topic for every entry the registry map
    /// declares as writable, so a retained MQTT message can feed back a
    /// write into the source transport via the bridge.
    pub async fn init_bridge(&self, registry_map: &[RegistryMapEntry]) -> Result<()> {
        for entry in registry_map {
            if entry.write_mode.is_writable() && entry.registry_type != RegistryType::Input {
                let topic = format!("{}/write/{}", self.base_topic, entry.variable_name);
                self.client
                    .subscribe(topic, QoS::AtLeastOnce)
                    .await
                    .map_err(|e| GatewayError::TransientIo(std::io::Error::other(e)))?;
            }
        }
        Ok(())
    }

    /// Publish a Home-Assistant MQTT discovery payload for every entry
    /// eligible for it (readable, non-`ASCII`/`HEX` blob types).
    pub async fn publish_discovery(&self, device: &DeviceInfo, registry_map: &[RegistryMapEntry]) -> Result<()> {
        for entry in registry_map {
            if !entry.write_mode.is_readable() {
                continue;
            }
            let state_topic = format!("{}/{}", self.base_topic, entry.variable_name);
            let unique_id = format!("{}_{}", device.identifier, entry.variable_name);
            let discovery_topic = format!(
                "homeassistant/sensor/{}/{}/config",
                device.identifier, entry.variable_name
            );
            let payload = json!({
                "name": entry.documented_name.clone().unwrap_or_else(|| entry.variable_name.clone()),
                "state_topic": state_topic,
                "unique_id": unique_id,
                "unit_of_measurement": entry.unit,
                "device": {
                    "identifiers": [device.identifier.clone()],
                    "name": device.name,
                    "manufacturer": device.manufacturer,
                    "model": device.model,
                },
            });
            self.client
                .publish(discovery_topic, QoS::AtLeastOnce, true, payload.to_string())
                .await
                .map_err(|e| GatewayError::TransientIo(std::io::Error::other(e)))?;
        }
        Ok(())
    }

    /// Publish an availability message plus the readings themselves, as
    /// either one retained JSON blob under the base topic or one retained
    /// message per variable under `<base>/<variable>`.
    pub async fn write_data(&self, data: &Reading) -> Result<()> {
        self.client
            .publish(format!("{}/availability", self.base_topic), QoS::AtLeastOnce, true, "online")
            .await
            .map_err(|e| GatewayError::TransientIo(std::io::Error::other(e)))?;

        if self.single_json_payload {
            let rounded: Reading = data
                .iter()
                .map(|(k, v)| (k.clone(), self.round_if_numeric(v)))
                .collect();
            let payload = serde_json::to_string(&rounded).expect("Reading always serializes");
            self.client
                .publish(&self.base_topic, QoS::AtLeastOnce, true, payload)
                .await
                .map_err(|e| GatewayError::TransientIo(std::io::Error::other(e)))?;
        } else {
            for (variable, value) in data {
                let topic = format!("{}/{}", self.base_topic, variable);
                let value = self.round_if_numeric(value);
                self.client
                    .publish(topic, QoS::AtLeastOnce, true, value)
                    .await
                    .map_err(|e| GatewayError::TransientIo(std::io::Error::other(e)))?;
            }
        }
        Ok(())
    }

    fn round_if_numeric(&self, value: &str) -> String {
        let Some(precision) = self.max_precision else {
            return value.to_string();
        };
        match value.parse::<f64>() {
            Ok(v) => format!("{v:.precision$}", precision = precision as usize),
            Err(_) => value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_numeric_values_to_max_precision() {
        let sink = MqttSink::new("localhost", 1883, "test", "gateway".into(), true, Some(1));
        assert_eq!(sink.round_if_numeric("3.14159"), "3.1");
        assert_eq!(sink.round_if_numeric("not_a_number"), "not_a_number");
    }
}
