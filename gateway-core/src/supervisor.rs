//! Ties protocol specs, Modbus/CAN sources, and output sinks together into
//! a running gateway: one task (or, in cooperative mode, one loop
//! iteration) per configured transport, bridging readings from a source
//! transport to the sink transport it names in its `bridge=` key.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::config::{GatewayConfig, TransportConfig};
use crate::error::{GatewayError, Result};
use crate::modbus::{ModbusEngine, ModbusLink, RtuLink, TcpLink, TlsLink, UdpLink};
use crate::processor;
use crate::sinks::{DeviceInfo, InfluxSink, JsonSink, MqttSink, Reading};
use crate::spec::ProtocolSpec;
use crate::transports::CanCache;

/// A transport that produces readings by polling a device.
enum Source {
    Modbus {
        engine: ModbusEngine,
        spec: ProtocolSpec,
        first_poll: bool,
    },
    Can {
        cache: CanCache,
        spec: ProtocolSpec,
    },
    Pylon {
        client: crate::transports::SerialFrameClient,
        spec: ProtocolSpec,
    },
}

/// A transport that consumes readings produced by a [`Source`].
enum Sink {
    Json(JsonSink),
    Mqtt(MqttSink),
    Influx(InfluxSink),
}

struct TransportRuntime {
    config: TransportConfig,
    device: DeviceInfo,
}

/// Owns every configured transport and drives the poll/bridge loop for
/// the gateway's lifetime.
pub struct Supervisor {
    config: GatewayConfig,
    sources: HashMap<String, (TransportRuntime, Source)>,
    sinks: HashMap<String, (TransportRuntime, Sink)>,
}

impl Supervisor {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            sources: HashMap::new(),
            sinks: HashMap::new(),
        }
    }

    /// Instantiate every `[transport.*]` section via the type-keyed
    /// factory below, mirroring the reference gateway's dynamic
    /// `importlib.import_module`-style dispatch without needing runtime
    /// code loading: the set of transport kinds is closed and known at
    /// compile time, so a match arm per kind is both simpler and safer.
    pub async fn build(&mut self, spec_root: &Path) -> Result<()> {
        let transports: Vec<TransportConfig> = self.config.transports.values().cloned().collect();
        for transport in transports {
            let device = DeviceInfo {
                identifier: transport.get("identifier").unwrap_or(&transport.name).to_string(),
                name: transport.get("name").unwrap_or(&transport.name).to_string(),
                manufacturer: transport.get("manufacturer").unwrap_or_default().to_string(),
                model: transport.get("model").unwrap_or_default().to_string(),
                serial_number: String::new(),
                transport_name: transport.name.clone(),
            };
            let runtime = TransportRuntime {
                config: transport.clone(),
                device,
            };

            match transport.kind.as_str() {
                "modbus_rtu" | "modbus_tcp" | "modbus_udp" | "modbus_tls" => {
                    let source = self.build_modbus_source(&transport, spec_root).await?;
                    self.sources.insert(transport.name.clone(), (runtime, source));
                }
                "canbus" => {
                    let source = self.build_can_source(&transport, spec_root)?;
                    self.sources.insert(transport.name.clone(), (runtime, source));
                }
                "serial_pylon" => {
                    let source = self.build_pylon_source(&transport, spec_root).await?;
                    self.sources.insert(transport.name.clone(), (runtime, source));
                }
                "json" => {
                    let sink = build_json_sink(&transport);
                    self.sinks.insert(transport.name.clone(), (runtime, Sink::Json(sink)));
                }
                "mqtt" => {
                    let sink = build_mqtt_sink(&transport);
                    self.sinks.insert(transport.name.clone(), (runtime, Sink::Mqtt(sink)));
                }
                "influxdb" => {
                    let sink = build_influx_sink(&transport);
                    self.sinks.insert(transport.name.clone(), (runtime, Sink::Influx(sink)));
                }
                other => {
                    return Err(GatewayError::Config(format!(
                        "[transport.{}]: unknown transport type \"{other}\"",
                        transport.name
                    )))
                }
            }
        }
        Ok(())
    }

    async fn build_modbus_source(&self, transport: &TransportConfig, spec_root: &Path) -> Result<Source> {
        let protocol_name = transport
            .get("protocol")
            .ok_or_else(|| GatewayError::Config(format!("[transport.{}] missing protocol=", transport.name)))?;
        let batch_size = transport.get_int("batch_size", 45) as u16;
        let default_interval_s = transport.get_int("read_interval", 5) as u64;
        let spec = ProtocolSpec::load_from_dir(spec_root.join(protocol_name), batch_size, default_interval_s)?;

        let unit_id = transport.get_int("address", 1) as u8;
        let link = match transport.kind.as_str() {
            "modbus_rtu" => {
                let port = transport
                    .get("port")
                    .ok_or_else(|| GatewayError::Config(format!("[transport.{}] missing port=", transport.name)))?
                    .to_string();
                let baud = transport.get_int("baudrate", 9600) as u32;
                ModbusLink::Rtu(RtuLink::new(port, baud, unit_id))
            }
            "modbus_tcp" => {
                let host = transport.get("host").unwrap_or("127.0.0.1").to_string();
                let port = transport.get_int("port", 502) as u16;
                ModbusLink::Tcp(TcpLink::new(host, port, unit_id))
            }
            "modbus_udp" => {
                let host = transport.get("host").unwrap_or("127.0.0.1").to_string();
                let port = transport.get_int("port", 502) as u16;
                ModbusLink::Udp(UdpLink::new(host, port, unit_id))
            }
            "modbus_tls" => {
                let host = transport.get("host").unwrap_or("127.0.0.1").to_string();
                let port = transport.get_int("port", 802) as u16;
                ModbusLink::Tls(TlsLink::new(host, port, unit_id))
            }
            other => unreachable!("build_modbus_source called for non-Modbus kind {other}"),
        };

        let mut engine = ModbusEngine::new(link);
        engine.connect().await?;

        Ok(Source::Modbus { engine, spec, first_poll: true })
    }

    fn build_can_source(&self, transport: &TransportConfig, spec_root: &Path) -> Result<Source> {
        let protocol_name = transport
            .get("protocol")
            .ok_or_else(|| GatewayError::Config(format!("[transport.{}] missing protocol=", transport.name)))?;
        let spec = ProtocolSpec::load_from_dir(spec_root.join(protocol_name), 45, 5)?;
        let cache_timeout = Duration::from_secs_f64(transport.get_float("cache_timeout", 30.0));
        Ok(Source::Can {
            cache: CanCache::new(cache_timeout),
            spec,
        })
    }

    async fn build_pylon_source(&self, transport: &TransportConfig, spec_root: &Path) -> Result<Source> {
        let protocol_name = transport
            .get("protocol")
            .ok_or_else(|| GatewayError::Config(format!("[transport.{}] missing protocol=", transport.name)))?;
        let spec = ProtocolSpec::load_from_dir(spec_root.join(protocol_name), 45, 5)?;
        let port = transport
            .get("port")
            .ok_or_else(|| GatewayError::Config(format!("[transport.{}] missing port=", transport.name)))?
            .to_string();
        let baud = transport.get_int("baudrate", 9600) as u32;
        let mut client = crate::transports::SerialFrameClient::new(port, baud);
        client.connect().await?;
        Ok(Source::Pylon { client, spec })
    }

    /// Drive every configured transport until a fatal error occurs. In
    /// cooperative mode, one `tokio::select!`-style round-robin loop
    /// polls every source in turn on a shared interval; in parallel mode,
    /// each source gets its own task so a slow bus on one transport can't
    /// delay another's poll cadence.
    pub async fn run(mut self) -> Result<()> {
        let poll_interval = self.config.global.poll_interval;
        if self.config.global.parallel {
            self.run_parallel(poll_interval).await
        } else {
            self.run_cooperative(poll_interval).await
        }
    }

    async fn run_cooperative(mut self, poll_interval: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let names: Vec<String> = self.sources.keys().cloned().collect();
            for name in names {
                if let Err(err) = self.poll_and_bridge(&name).await {
                    tracing::warn!(transport = %name, error = %err, "source poll failed");
                }
            }
        }
    }

    async fn run_parallel(self, poll_interval: Duration) -> Result<()> {
        let Supervisor { sources, sinks, config } = self;
        let sinks = std::sync::Arc::new(tokio::sync::Mutex::new(sinks));
        let mut handles = Vec::new();
        for (name, (runtime, source)) in sources {
            let sinks = sinks.clone();
            let bridge = runtime.config.bridge.clone();
            let device = runtime.device.clone();
            handles.push(tokio::spawn(async move {
                let mut source = source;
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match poll_source(&mut source).await {
                        Ok(reading) => {
                            if let Some(bridge) = &bridge {
                                let mut sinks = sinks.lock().await;
                                if let Some((_, sink)) = sinks.get_mut(bridge) {
                                    if let Err(err) = deliver(sink, &device, &reading).await {
                                        tracing::warn!(transport = %name, bridge, error = %err, "failed delivering reading to bridge");
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            tracing::warn!(transport = %name, error = %err, "source poll failed, will retry next tick");
                        }
                    }
                }
            }));
        }
        let _ = config;
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn poll_and_bridge(&mut self, name: &str) -> Result<()> {
        let bridge_name = self
            .sources
            .get(name)
            .and_then(|(r, _)| r.config.bridge.clone());
        let device = self
            .sources
            .get(name)
            .map(|(r, _)| r.device.clone())
            .unwrap_or_default();

        let reading = {
            let (_, source) = self.sources.get_mut(name).expect("checked above");
            poll_source(source).await?
        };

        if let Some(bridge_name) = bridge_name {
            if let Some((_, sink)) = self.sinks.get_mut(&bridge_name) {
                deliver(sink, &device, &reading).await?;
            }
        }
        Ok(())
    }
}

async fn poll_source(source: &mut Source) -> Result<Reading> {
    match source {
        Source::Modbus { engine, spec, first_poll } => {
            let ranges = spec.calculate_read_ranges(spec.batch_size, *first_poll, unix_timestamp_ms());
            *first_poll = false;
            let snapshot = engine.execute_read_plan(&ranges).await?;
            Ok(processor::process_registry(spec, &snapshot))
        }
        Source::Can { cache, spec } => {
            cache.clean().await;
            let mut snapshot = processor::RegisterSnapshot::new();
            for entry in &spec.registry_map {
                if let Some(bytes) = cache.get(entry.register).await {
                    snapshot.insert_bytes(entry.registry_type, entry.register, bytes);
                }
            }
            Ok(processor::process_registry(spec, &snapshot))
        }
        Source::Pylon { client, spec } => {
            let mut snapshot = processor::RegisterSnapshot::new();
            for entry in &spec.registry_map {
                if !entry.write_mode.is_readable() {
                    continue;
                }
                let command = entry.register as u16;
                let frame = crate::transports::pylon::build_frame(0x20, 0x00, command, &[]);
                if let Err(err) = client.write(&frame).await {
                    tracing::debug!(variable = %entry.variable_name, error = %err, "Pylon command send failed");
                    continue;
                }
                let raw = match client.read().await {
                    Ok(r) => r,
                    Err(err) => {
                        tracing::debug!(variable = %entry.variable_name, error = %err, "Pylon frame read failed");
                        continue;
                    }
                };
                let decoded = match crate::transports::pylon::decode_frame(&raw) {
                    Ok(d) => d,
                    Err(err) => {
                        tracing::warn!(variable = %entry.variable_name, error = %err, "Pylon frame decode failed");
                        continue;
                    }
                };
                snapshot.insert_bytes(entry.registry_type, entry.register, decoded.info);
            }
            Ok(processor::process_registry(spec, &snapshot))
        }
    }
}

async fn deliver(sink: &mut Sink, device: &DeviceInfo, reading: &Reading) -> Result<()> {
    match sink {
        Sink::Json(json) => json.write(device, reading, unix_timestamp()),
        Sink::Mqtt(mqtt) => mqtt.write_data(reading).await,
        Sink::Influx(influx) => {
            influx.add_point(&device.transport_name, &[("identifier", &device.identifier)], reading, unix_timestamp_ns());
            influx.flush_if_due().await
        }
    }
}

fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn unix_timestamp_ns() -> i128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0)
}

fn build_json_sink(transport: &TransportConfig) -> JsonSink {
    JsonSink::new(
        transport.get("output_file").unwrap_or("stdout").to_string(),
        transport.get_bool("pretty_print", true),
        transport.get_bool("append_mode", false),
        transport.get_bool("include_timestamp", true),
        transport.get_bool("include_device_info", true),
    )
}

fn build_mqtt_sink(transport: &TransportConfig) -> MqttSink {
    MqttSink::new(
        transport.get("host").unwrap_or("localhost"),
        transport.get_int("port", 1883) as u16,
        transport.get("client_id").unwrap_or(&transport.name),
        transport.get("base_topic").unwrap_or(&transport.name).to_string(),
        transport.get_bool("single_json_payload", false),
        transport.get("max_precision").and_then(|v| v.parse().ok()),
    )
}

fn build_influx_sink(transport: &TransportConfig) -> InfluxSink {
    InfluxSink::new(
        transport.get("url").unwrap_or("http://localhost:8086"),
        transport.get("org").unwrap_or(""),
        transport.get("bucket").unwrap_or(""),
        transport.get("token").unwrap_or("").to_string(),
        transport.get_int("batch_max_size", 100) as usize,
        Duration::from_secs_f64(transport.get_float("batch_max_age_seconds", 30.0)),
        Duration::from_secs_f64(transport.get_float("max_reconnect_delay_seconds", 300.0)),
        transport.get("backlog_path").map(std::path::PathBuf::from),
    )
}

