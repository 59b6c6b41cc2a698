pub mod influxdb;
pub mod json;
pub mod mqtt;

use std::collections::BTreeMap;

pub use influxdb::InfluxSink;
pub use json::JsonSink;
pub use mqtt::MqttSink;

/// Static identity of the device a batch of readings came from, carried
/// alongside the readings themselves so a sink with several upstream
/// transports can tag each write.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub transport_name: String,
}

/// `variable_name -> display string`, the shape every protocol decode
/// produces and every sink consumes.
pub type Reading = BTreeMap<String, String>;
