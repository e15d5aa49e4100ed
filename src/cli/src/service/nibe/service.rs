use std::sync::Arc;

use crate::service::mqtt::Publisher;
use crate::*;

use super::catalog::*;
use super::driver::AckPolicy;
use super::gateway::*;
use super::metrics::Metrics;

#[derive(Clone)]
pub(crate) struct Service {
  gateway: Arc<Gateway>,
  ack: AckPolicy,
}

impl Service {
  pub(crate) fn new(
    config: config::Values,
    publisher: Arc<dyn Publisher>,
  ) -> Self {
    let gateway = Gateway::new(
      CatalogHandle::default(),
      publisher,
      Arc::new(Metrics::new()),
      GatewaySettings {
        root_topic: config.mqtt.root_topic,
        discovery: config.mqtt.discovery,
        queue_capacity: config.poll.queue_capacity,
      },
    );

    Self {
      gateway: Arc::new(gateway),
      ack: config.serial.ack,
    }
  }

  pub(crate) fn gateway(&self) -> &Arc<Gateway> {
    &self.gateway
  }

  pub(crate) fn metrics(&self) -> &Arc<Metrics> {
    self.gateway.metrics()
  }

  pub(crate) fn ack(&self) -> AckPolicy {
    self.ack
  }

  /// Installs a freshly parsed catalog. On failure the active catalog is
  /// left untouched.
  #[tracing::instrument(skip(self, catalog), fields(path = ?catalog.path))]
  pub(crate) async fn reload_catalog(
    &self,
    catalog: &config::Catalog,
  ) -> Result<usize, LoadError> {
    let loaded = RegisterCatalog::read(&catalog.path, &catalog.settings).await?;
    let len = loaded.len();
    self.gateway.catalog().replace(loaded);

    tracing::info!("Loaded {} registers", len);

    Ok(len)
  }
}
