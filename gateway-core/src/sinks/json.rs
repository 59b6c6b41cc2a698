use std::fs::OpenOptions;
use std::io::Write;

use serde_json::json;

use crate::error::Result;
use crate::sinks::{DeviceInfo, Reading};

/// Writes decoded readings as a single JSON object per call, either to
/// stdout or appended to a file. There is never more than one writer: a
/// single `JsonSink` owns its output, so no locking is needed across
/// concurrent transports.
pub struct JsonSink {
    output_file: String,
    pretty_print: bool,
    append_mode: bool,
    include_timestamp: bool,
    include_device_info: bool,
}

impl JsonSink {
    pub fn new(
        output_file: String,
        pretty_print: bool,
        append_mode: bool,
        include_timestamp: bool,
        include_device_info: bool,
    ) -> Self {
        Self {
            output_file,
            pretty_print,
            append_mode,
            include_timestamp,
            include_device_info,
        }
    }

    pub fn write(&self, device: &DeviceInfo, data: &Reading, unix_timestamp: f64) -> Result<()> {
        let mut output = serde_json::Map::new();
        if self.include_device_info {
            output.insert(
                "device".into(),
                json!({
                    "identifier": device.identifier,
                    "name": device.name,
                    "manufacturer": device.manufacturer,
                    "model": device.model,
                    "serial_number": device.serial_number,
                    "transport": device.transport_name,
                }),
            );
        }
        if self.include_timestamp {
            output.insert("timestamp".into(), json!(unix_timestamp));
        }
        output.insert("data".into(), json!(data));

        let value = serde_json::Value::Object(output);
        let text = if self.pretty_print {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .expect("Reading/DeviceInfo always serialize");

        if self.output_file.eq_ignore_ascii_case("stdout") {
            println!("{text}");
        } else {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(self.append_mode)
                .truncate(!self.append_mode)
                .open(&self.output_file)?;
            writeln!(file, "{text}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_to_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let sink = JsonSink::new(path.to_string_lossy().into_owned(), false, false, false, true);
        let device = DeviceInfo {
            identifier: "dev1".into(),
            ..Default::default()
        };
        let mut data = Reading::new();
        data.insert("voltage".into(), "230".into());
        sink.write(&device, &data, 0.0).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("voltage"));
        assert!(content.contains("dev1"));
    }
}
