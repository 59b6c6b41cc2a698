//! The read/write engine: adaptive inter-request pacing, bounded retries
//! per read range, the write-validation gate, and serial-number discovery.

use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::error::{GatewayError, Result};
use crate::modbus::transport::{ModbusLink, ModbusTransport};
use crate::processor::{self, RegisterSnapshot};
use crate::spec::codec::{decode, RawValue};
use crate::spec::types::{DataType, ReadRange, RegistryMapEntry, RegistryType, WriteMode};
use crate::spec::ProtocolSpec;

const NOMINAL_DELAY: Duration = Duration::from_millis(850);
const DELAY_STEP: Duration = Duration::from_millis(50);
const MAX_DELAY: Duration = Duration::from_secs(60);
const MAX_RETRIES: u32 = 7;
const WRITE_SCORE_THRESHOLD: f64 = 0.90;

/// How strictly a device must match its declared protocol before writes
/// are allowed against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Require a protocol validation score of at least 90%.
    Strict,
    /// Allow writes regardless of score, but still log the mismatch.
    Relaxed,
    /// Allow writes with no validation at all.
    Unsafe,
}

/// Adaptive per-link pacing plus retry bookkeeping, mirroring how a
/// deployed gateway backs off a flaky RS-485 bus without a human tuning
/// fixed delays per site.
pub struct ModbusEngine {
    link: ModbusLink,
    delay: Duration,
    last_request: Option<Instant>,
    protocol_score: Option<f64>,
}

impl ModbusEngine {
    pub fn new(link: ModbusLink) -> Self {
        Self {
            link,
            delay: NOMINAL_DELAY,
            last_request: None,
            protocol_score: None,
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.link.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    async fn pace(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                sleep(self.delay - elapsed).await;
            }
        }
        self.last_request = Some(Instant::now());
    }

    fn on_success(&mut self) {
        self.delay = self.delay.saturating_sub(DELAY_STEP).max(NOMINAL_DELAY / 4);
    }

    fn on_error(&mut self) {
        self.delay = (self.delay + DELAY_STEP).min(MAX_DELAY);
    }

    async fn read_range_once(&mut self, range: &ReadRange) -> Result<Vec<u16>> {
        self.pace().await;
        let start = range.start as u16;
        let result = match range.registry_type {
            RegistryType::Holding | RegistryType::Zero => {
                self.link.read_holding_registers(start, range.length).await
            }
            RegistryType::Input => self.link.read_input_registers(start, range.length).await,
        };
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_error(),
        }
        result
    }

    async fn read_entry_words(&mut self, entry: &RegistryMapEntry) -> Option<Vec<u16>> {
        let range = ReadRange {
            registry_type: entry.registry_type,
            start: entry.register,
            length: entry.register_span(),
        };
        self.read_range_once(&range).await.ok()
    }

    /// Read every range, retrying each one independently up to
    /// [`MAX_RETRIES`] times, and fold the results into a snapshot. A range
    /// that never succeeds is dropped with a warning rather than failing
    /// the whole poll cycle, so one bad bank doesn't blank out an entire
    /// device's readings.
    pub async fn execute_read_plan(&mut self, ranges: &[ReadRange]) -> Result<RegisterSnapshot> {
        let mut snapshot = RegisterSnapshot::new();
        for range in ranges {
            let mut attempt = 0;
            loop {
                match self.read_range_once(range).await {
                    Ok(regs) => {
                        snapshot.insert_range(range.registry_type, range.start, &regs);
                        break;
                    }
                    Err(err) if attempt < MAX_RETRIES => {
                        attempt += 1;
                        tracing::debug!(?range, attempt, error = %err, "retrying Modbus read range");
                    }
                    Err(err) => {
                        tracing::warn!(?range, error = %err, "giving up on Modbus read range");
                        break;
                    }
                }
            }
        }
        Ok(snapshot)
    }

    /// Apply pre-validated register writes (see
    /// [`crate::processor::write_variable`]) to the device, gated by
    /// `policy` and, for [`WritePolicy::Strict`]/[`WritePolicy::Relaxed`],
    /// the last-computed protocol validation score (see
    /// [`Self::analyze_protocol`]).
    pub async fn write_validated(
        &mut self,
        writes: &[(RegistryType, u32, u16)],
        policy: WritePolicy,
    ) -> Result<()> {
        let score = self.protocol_score.unwrap_or(0.0);
        match policy {
            WritePolicy::Unsafe => {
                tracing::warn!("writing with protocol validation disabled (unsafe write policy)");
            }
            WritePolicy::Strict if score < WRITE_SCORE_THRESHOLD => {
                return Err(GatewayError::Validation(format!(
                    "refusing write: protocol validation score {:.0}% is below the 90% threshold required in strict mode",
                    score * 100.0
                )));
            }
            WritePolicy::Relaxed if score < WRITE_SCORE_THRESHOLD => {
                tracing::warn!(
                    score_pct = score * 100.0,
                    "writing despite protocol validation score below 90% (relaxed write policy)"
                );
            }
            _ => {}
        }
        for (_, addr, value) in writes {
            self.pace().await;
            let result = self.link.write_single_register(*addr as u16, *value).await;
            match &result {
                Ok(_) => self.on_success(),
                Err(_) => self.on_error(),
            }
            result?;
        }
        Ok(())
    }

    /// Derive a stable device identifier. Tries the spec's own
    /// `serial_number` entry first (checking `INPUT` then `HOLDING`), then
    /// falls back to the legacy `"Serial No 1".."Serial No 5"` holding
    /// registers some older device families use instead of a single named
    /// entry, each register's two bytes read as ASCII; the byte-swapped
    /// reading is preferred when it alone comes out alphanumeric-clean.
    pub async fn discover_serial_number(&mut self, spec: &ProtocolSpec) -> Option<String> {
        for registry_type in [RegistryType::Input, RegistryType::Holding] {
            let Some(entry) = spec
                .registry_map
                .iter()
                .find(|e| e.variable_name == "serial_number" && e.registry_type == registry_type)
            else {
                continue;
            };
            let Some(regs) = self.read_entry_words(entry).await else { continue };
            let byteorder = entry.effective_byteorder(spec.default_byteorder);
            let Ok(raw) = decode(entry, &regs, byteorder) else { continue };
            let text = match raw {
                RawValue::Text(s) => s,
                RawValue::Integer(v) => v.to_string(),
            };
            let trimmed = text.trim();
            if !trimmed.is_empty() && trimmed != "None" {
                return Some(trimmed.to_string());
            }
        }

        let mut natural = String::new();
        let mut reversed = String::new();
        let mut found_any = false;
        for i in 1..=5u8 {
            let legacy = format!("serial_no_{i}");
            let Some(entry) = spec.registry_map.iter().find(|e| {
                e.registry_type == RegistryType::Holding
                    && (e.documented_name.as_deref() == Some(legacy.as_str()) || e.variable_name == legacy)
            }) else {
                continue;
            };
            let Some(word) = self.read_entry_words(entry).await.and_then(|r| r.first().copied()) else {
                continue;
            };
            found_any = true;
            let hi = (word >> 8) as u8;
            let lo = (word & 0xFF) as u8;
            natural.push(lo as char);
            natural.push(hi as char);
            reversed.push(hi as char);
            reversed.push(lo as char);
        }
        if !found_any {
            return None;
        }

        let is_clean = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        let reversed = reversed.trim_matches('\0').trim().to_string();
        let natural = natural.trim_matches('\0').trim().to_string();
        if is_clean(&reversed) {
            Some(reversed)
        } else if !natural.is_empty() {
            Some(natural)
        } else {
            None
        }
    }

    /// Score how well a device's live responses match the protocol spec it
    /// was configured with, reusing [`processor::validate_registry_entry`]
    /// so the write-safety gate and this diagnostic agree on what "matches"
    /// means. Sweeps `HOLDING` excluding `READ_DISABLED`/`WRITE_ONLY`
    /// entries; the result also becomes this engine's cached
    /// `protocol_score` for [`Self::write_validated`].
    pub async fn analyze_protocol(&mut self, spec: &ProtocolSpec) -> f64 {
        let eligible: Vec<&RegistryMapEntry> = spec
            .registry_map
            .iter()
            .filter(|e| e.registry_type == RegistryType::Holding)
            .filter(|e| !matches!(e.write_mode, WriteMode::ReadDisabled | WriteMode::WriteOnly))
            .collect();

        if eligible.is_empty() {
            self.protocol_score = Some(1.0);
            return 1.0;
        }

        let mut score = 0i64;
        let mut max_score = 0i64;
        for entry in eligible {
            let entry_max = if entry.data_type == DataType::Ascii {
                entry.concatenate_registers.len().max(1) as i64
            } else {
                1
            };
            max_score += entry_max;

            let Some(regs) = self.read_entry_words(entry).await else { continue };
            let byteorder = entry.effective_byteorder(spec.default_byteorder);
            let Ok(raw) = decode(entry, &regs, byteorder) else { continue };
            let text = match raw {
                RawValue::Text(s) => s,
                RawValue::Integer(v) => v.to_string(),
            };
            score += processor::validate_registry_entry(spec, entry, &text);
        }

        let fraction = if max_score > 0 { score as f64 / max_score as f64 } else { 1.0 };
        self.protocol_score = Some(fraction);
        fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_policy_equality() {
        assert_eq!(WritePolicy::Strict, WritePolicy::Strict);
        assert_ne!(WritePolicy::Strict, WritePolicy::Relaxed);
    }
}
