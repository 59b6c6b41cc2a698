//! InfluxDB line-protocol sink: batches points by size or age, persists a
//! bounded on-disk backlog across outages, and reconnects with
//! exponential backoff plus a periodic forced reconnect to pick up DNS
//! and load-balancer changes that a long-lived connection would miss.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::{GatewayError, Result};
use crate::sinks::Reading;

const MAX_BACKLOG_ENTRIES: usize = 10_000;
const MAX_BACKLOG_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    token: String,
    batch: Vec<String>,
    batch_max_size: usize,
    batch_max_age: Duration,
    batch_opened_at: Instant,
    backlog: VecDeque<(String, Instant)>,
    backlog_path: Option<PathBuf>,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    last_reconnect_attempt: Option<Instant>,
    last_successful_ping: Option<Instant>,
    force_reconnect_interval: Duration,
    connected: bool,
}

impl InfluxSink {
    pub fn new(
        base_url: &str,
        org: &str,
        bucket: &str,
        token: String,
        batch_max_size: usize,
        batch_max_age: Duration,
        max_reconnect_delay: Duration,
        backlog_path: Option<PathBuf>,
    ) -> Self {
        let write_url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            base_url.trim_end_matches('/'),
            org,
            bucket
        );
        let mut sink = Self {
            client: reqwest::Client::new(),
            write_url,
            token,
            batch: Vec::new(),
            batch_max_size,
            batch_max_age,
            batch_opened_at: Instant::now(),
            backlog: VecDeque::new(),
            backlog_path,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay,
            last_reconnect_attempt: None,
            last_successful_ping: None,
            force_reconnect_interval: Duration::from_secs(3600),
            connected: false,
        };
        sink.load_backlog();
        sink
    }

    fn backlog_path(&self) -> Option<&PathBuf> {
        self.backlog_path.as_ref()
    }

    fn load_backlog(&mut self) {
        let Some(path) = self.backlog_path() else { return };
        let Ok(content) = std::fs::read_to_string(path) else { return };
        for line in content.lines().filter(|l| !l.is_empty()) {
            self.backlog.push_back((line.to_string(), Instant::now()));
        }
    }

    fn save_backlog(&self) {
        let Some(path) = self.backlog_path() else { return };
        let content: String = self
            .backlog
            .iter()
            .map(|(line, _)| line.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if let Err(err) = std::fs::write(path, content) {
            tracing::warn!(error = %err, "failed to persist InfluxDB backlog to disk");
        }
    }

    fn add_to_backlog(&mut self, line: String) {
        if self.backlog.len() >= MAX_BACKLOG_ENTRIES {
            tracing::warn!("InfluxDB backlog full, dropping oldest point");
            self.backlog.pop_front();
        }
        self.backlog.push_back((line, Instant::now()));
        self.save_backlog();
    }

    /// Turns a reading into one InfluxDB line-protocol point and queues it
    /// for the next flush.
    pub fn add_point(&mut self, measurement: &str, tags: &[(&str, &str)], fields: &Reading, timestamp_ns: i128) {
        if fields.is_empty() {
            return;
        }
        let tag_str: String = tags
            .iter()
            .map(|(k, v)| format!(",{}={}", escape(k), escape(v)))
            .collect();
        let field_str: String = fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), format_field(v)))
            .collect::<Vec<_>>()
            .join(",");
        let line = format!("{}{} {} {}", escape(measurement), tag_str, field_str, timestamp_ns);
        self.batch.push(line);
        if self.batch.len() == 1 {
            self.batch_opened_at = Instant::now();
        }
    }

    fn batch_is_due(&self) -> bool {
        !self.batch.is_empty()
            && (self.batch.len() >= self.batch_max_size || self.batch_opened_at.elapsed() >= self.batch_max_age)
    }

    /// Flushes the current batch if it's full or old enough, first
    /// draining anything left over in the on-disk backlog so delayed
    /// points land in chronological order.
    pub async fn flush_if_due(&mut self) -> Result<()> {
        if !self.batch_is_due() {
            return Ok(());
        }
        self.flush_backlog_then_batch().await
    }

    async fn flush_backlog_then_batch(&mut self) -> Result<()> {
        if !self.backlog.is_empty() {
            let lines: Vec<String> = self.backlog.iter().map(|(l, _)| l.clone()).collect();
            match self.send(&lines).await {
                Ok(()) => {
                    self.backlog.clear();
                    self.save_backlog();
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to flush InfluxDB backlog, will retry next cycle");
                    let batch = std::mem::take(&mut self.batch);
                    for line in batch {
                        self.add_to_backlog(line);
                    }
                    return Err(err);
                }
            }
        }

        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        match self.send(&batch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                for line in batch {
                    self.add_to_backlog(line);
                }
                Err(err)
            }
        }
    }

    async fn send(&mut self, lines: &[String]) -> Result<()> {
        let body = lines.join("\n");
        let response = self
            .client
            .post(&self.write_url)
            .header("Authorization", format!("Token {}", self.token))
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::TransientIo(std::io::Error::other(e)))?;
        if response.status().is_success() {
            self.connected = true;
            self.reconnect_delay = Duration::from_secs(1);
            Ok(())
        } else {
            self.connected = false;
            Err(GatewayError::Protocol(format!(
                "InfluxDB write rejected: HTTP {}",
                response.status()
            )))
        }
    }

    /// Periodic health check; also forces a reconnect (resetting backoff)
    /// every `force_reconnect_interval` so the sink doesn't stay pinned to
    /// a single backend behind a load balancer indefinitely.
    pub async fn ping(&mut self, base_url: &str) -> Result<()> {
        let due_for_forced_reconnect = self
            .last_successful_ping
            .map(|t| t.elapsed() >= self.force_reconnect_interval)
            .unwrap_or(false);

        let response = self
            .client
            .get(format!("{}/health", base_url.trim_end_matches('/')))
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => {
                self.last_successful_ping = Some(Instant::now());
                self.connected = true;
                self.reconnect_delay = Duration::from_secs(1);
                if due_for_forced_reconnect {
                    tracing::info!("forcing InfluxDB reconnect after periodic interval");
                    self.client = reqwest::Client::new();
                }
                Ok(())
            }
            _ => {
                self.connected = false;
                self.backoff_reconnect().await;
                Err(GatewayError::TransientIo(std::io::Error::other("InfluxDB health check failed")))
            }
        }
    }

    async fn backoff_reconnect(&mut self) {
        if let Some(last) = self.last_reconnect_attempt {
            if last.elapsed() < self.reconnect_delay {
                return;
            }
        }
        self.last_reconnect_attempt = Some(Instant::now());
        self.reconnect_delay = (self.reconnect_delay * 2).min(self.max_reconnect_delay);
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Drop backlog entries older than [`MAX_BACKLOG_AGE`], matching the
    /// size bound already enforced by [`Self::add_to_backlog`].
    pub fn evict_stale_backlog(&mut self) {
        let before = self.backlog.len();
        self.backlog.retain(|(_, t)| t.elapsed() < MAX_BACKLOG_AGE);
        if self.backlog.len() != before {
            self.save_backlog();
        }
    }
}

fn escape(s: &str) -> String {
    s.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

fn format_field(value: &str) -> String {
    if value.parse::<f64>().is_ok() {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('"', "\\\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_field_quotes_non_numeric() {
        assert_eq!(format_field("42"), "42");
        assert_eq!(format_field("on"), "\"on\"");
    }

    #[test]
    fn add_point_builds_line_protocol() {
        let mut sink = InfluxSink::new(
            "http://localhost:8086",
            "org",
            "bucket",
            "tok".into(),
            10,
            Duration::from_secs(5),
            Duration::from_secs(60),
            None,
        );
        let mut fields = Reading::new();
        fields.insert("voltage".into(), "230.5".into());
        sink.add_point("device", &[("id", "dev1")], &fields, 1_000);
        assert_eq!(sink.batch.len(), 1);
        assert!(sink.batch[0].starts_with("device,id=dev1 voltage=230.5 1000"));
    }
}
