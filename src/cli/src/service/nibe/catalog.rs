use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::parser::*;
use super::register::*;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub(crate) enum Cadence {
  Fast,
  Slow,
}

/// Export tweaks for a single register.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MetricOverride {
  pub(crate) name: Option<String>,
  pub(crate) factor: Option<i32>,
  pub(crate) scale: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CatalogSettings {
  pub(crate) retain_all: bool,
  pub(crate) fast: Vec<u16>,
  pub(crate) slow: Vec<u16>,
  pub(crate) metrics: HashMap<u16, MetricOverride>,
  pub(crate) discovery: HashMap<u16, serde_json::Value>,
}

impl CatalogSettings {
  pub(crate) fn is_polled(&self, id: u16) -> bool {
    self.fast.contains(&id) || self.slow.contains(&id)
  }
}

/// Immutable set of register definitions plus what to poll and how to
/// export it.
#[derive(Debug, Clone, Default)]
pub(crate) struct RegisterCatalog {
  registers: BTreeMap<u16, Register>,
  fast: Vec<u16>,
  slow: Vec<u16>,
  metrics: HashMap<u16, MetricOverride>,
  discovery: HashMap<u16, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum LoadError {
  #[error("Failed reading register export {0}")]
  Read(#[from] std::io::Error),

  #[error("Failed parsing register export {0}")]
  Parse(#[from] CatalogParseError),
}

impl RegisterCatalog {
  pub(crate) fn new(
    registers: BTreeMap<u16, Register>,
    settings: &CatalogSettings,
  ) -> Self {
    let known = |cadence: &str, ids: &[u16]| {
      let mut seen = HashSet::new();
      ids
        .iter()
        .copied()
        .filter(|id| {
          let readable = match registers.get(id) {
            Some(register) if register.mode.is_readable() => true,
            Some(_) => {
              tracing::warn!(
                "Register {} in the {} poll list is write only",
                id,
                cadence
              );
              false
            }
            None => {
              tracing::warn!(
                "Register {} in the {} poll list is not in the catalog",
                id,
                cadence
              );
              false
            }
          };
          readable && seen.insert(*id)
        })
        .collect::<Vec<_>>()
    };

    Self {
      fast: known("fast", &settings.fast),
      slow: known("slow", &settings.slow),
      metrics: settings.metrics.clone(),
      discovery: settings.discovery.clone(),
      registers,
    }
  }

  /// Parses an export keeping only the polled registers unless the
  /// settings ask for all of them.
  pub(crate) fn load(
    text: &[u8],
    settings: &CatalogSettings,
  ) -> Result<Self, CatalogParseError> {
    let mut registers = BTreeMap::new();
    let count = parse_catalog(text, Some(&mut registers), |id| {
      settings.retain_all || settings.is_polled(id)
    })?;

    tracing::debug!(
      "Parsed {} registers and retained {}",
      count,
      registers.len()
    );

    Ok(Self::new(registers, settings))
  }

  #[tracing::instrument(skip(settings))]
  pub(crate) async fn read(
    path: &Path,
    settings: &CatalogSettings,
  ) -> Result<Self, LoadError> {
    let text = tokio::fs::read(path).await?;
    let catalog = Self::load(&text, settings)?;

    Ok(catalog)
  }

  pub(crate) fn get(&self, id: u16) -> Option<&Register> {
    self.registers.get(&id)
  }

  pub(crate) fn len(&self) -> usize {
    self.registers.len()
  }

  pub(crate) fn poll_list(&self, cadence: Cadence) -> &[u16] {
    match cadence {
      Cadence::Fast => &self.fast,
      Cadence::Slow => &self.slow,
    }
  }

  pub(crate) fn metric_override(&self, id: u16) -> Option<&MetricOverride> {
    self.metrics.get(&id)
  }

  pub(crate) fn discovery_override(
    &self,
    id: u16,
  ) -> Option<&serde_json::Value> {
    self.discovery.get(&id)
  }
}

/// Shared pointer to the active catalog. Readers get a snapshot that stays
/// valid while a reload swaps in a new catalog.
#[derive(Debug, Clone, Default)]
pub(crate) struct CatalogHandle {
  inner: Arc<ArcSwap<RegisterCatalog>>,
}

impl CatalogHandle {
  pub(crate) fn snapshot(&self) -> Arc<RegisterCatalog> {
    self.inner.load_full()
  }

  pub(crate) fn replace(&self, catalog: RegisterCatalog) {
    self.inner.store(Arc::new(catalog));
  }
}
