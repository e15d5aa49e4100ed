use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use dashmap::DashMap;
use itertools::Itertools;

use super::register::format_fixed;

pub(crate) const FRAMES_RECEIVED: &str = "nibegw_frames_received_total";
pub(crate) const CHECKSUM_FAILURES: &str = "nibegw_checksum_failures_total";
pub(crate) const OVERSIZED_FRAMES: &str = "nibegw_oversized_frames_total";
pub(crate) const READ_TOKENS: &str = "nibegw_read_tokens_total";
pub(crate) const WRITE_TOKENS: &str = "nibegw_write_tokens_total";
pub(crate) const READ_REQUESTS: &str = "nibegw_read_requests_total";
pub(crate) const UNKNOWN_REGISTERS: &str = "nibegw_unknown_registers_total";
pub(crate) const QUEUE_DROPS: &str = "nibegw_queue_drops_total";
pub(crate) const POLL_LATENCY: &str = "nibegw_poll_latency_ms";

pub(crate) fn register_metric_name(id: u16) -> String {
  format!("nibegw_register{{register=\"{id}\"}}")
}

#[derive(Debug)]
struct Metric {
  value: AtomicI64,
  factor: AtomicI32,
}

/// Metrics shared between the driver thread and the exporter. Entries are
/// created on first use and never removed.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
  values: DashMap<String, Metric>,
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn set(&self, name: &str, value: i64, factor: i32) {
    if let Some(metric) = self.values.get(name) {
      metric.value.store(value, Ordering::Relaxed);
      metric.factor.store(factor, Ordering::Relaxed);
      return;
    }

    self.values.insert(
      name.to_owned(),
      Metric {
        value: AtomicI64::new(value),
        factor: AtomicI32::new(factor),
      },
    );
  }

  pub(crate) fn increment(&self, name: &str) {
    if let Some(metric) = self.values.get(name) {
      metric.value.fetch_add(1, Ordering::Relaxed);
      return;
    }

    self
      .values
      .entry(name.to_owned())
      .or_insert_with(|| Metric {
        value: AtomicI64::new(0),
        factor: AtomicI32::new(1),
      })
      .value
      .fetch_add(1, Ordering::Relaxed);
  }

  #[cfg(test)]
  pub(crate) fn get(&self, name: &str) -> Option<i64> {
    self
      .values
      .get(name)
      .map(|metric| metric.value.load(Ordering::Relaxed))
  }

  /// One `<name> <value>` line per metric, sorted by name.
  pub(crate) fn export(&self) -> String {
    self
      .values
      .iter()
      .map(|entry| {
        let value = entry.value().value.load(Ordering::Relaxed);
        let factor = entry.value().factor.load(Ordering::Relaxed);
        (entry.key().clone(), format_metric(value, factor))
      })
      .sorted()
      .map(|(name, value)| format!("{name} {value}\n"))
      .collect()
  }
}

fn format_metric(value: i64, factor: i32) -> String {
  match i32::try_from(value) {
    Ok(value) => format_fixed(value, factor),
    Err(_) if factor <= 1 => value.to_string(),
    Err(_) => format!("{:.6}", value as f64 / f64::from(factor)),
  }
}
