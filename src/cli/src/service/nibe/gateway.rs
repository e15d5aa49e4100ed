use std::sync::Arc;
use std::time::Instant;

use dashmap::DashSet;
use parking_lot::Mutex;

use super::catalog::*;
use super::discovery::*;
use super::driver::Callback;
use super::metrics::{self, Metrics};
use super::protocol::*;
use crate::service::mqtt::{Publisher, QoS};

#[derive(Debug, Clone)]
pub(crate) struct GatewaySettings {
  pub(crate) root_topic: String,
  pub(crate) discovery: Option<DiscoverySettings>,
  pub(crate) queue_capacity: usize,
}

/// Bridges the protocol driver to the message bus. Poll schedulers
/// enqueue register ids, the driver thread drains them one per read token
/// and hands back every frame it receives.
pub(crate) struct Gateway {
  catalog: CatalogHandle,
  sender: flume::Sender<u16>,
  receiver: flume::Receiver<u16>,
  announced: DashSet<u16>,
  metrics: Arc<Metrics>,
  publisher: Arc<dyn Publisher>,
  poll_started: Mutex<Option<Instant>>,
  settings: GatewaySettings,
}

impl Gateway {
  pub(crate) fn new(
    catalog: CatalogHandle,
    publisher: Arc<dyn Publisher>,
    metrics: Arc<Metrics>,
    settings: GatewaySettings,
  ) -> Self {
    let (sender, receiver) = flume::bounded(settings.queue_capacity.max(1));

    Self {
      catalog,
      sender,
      receiver,
      announced: DashSet::new(),
      metrics,
      publisher,
      poll_started: Mutex::new(None),
      settings,
    }
  }

  pub(crate) fn catalog(&self) -> &CatalogHandle {
    &self.catalog
  }

  pub(crate) fn metrics(&self) -> &Arc<Metrics> {
    &self.metrics
  }

  /// Queues every register of the given poll list and starts the latency
  /// clock.
  #[tracing::instrument(skip(self))]
  pub(crate) fn schedule_poll(&self, cadence: Cadence) -> usize {
    let catalog = self.catalog.snapshot();
    let enqueued = self.enqueue(catalog.poll_list(cadence));
    *self.poll_started.lock() = Some(Instant::now());

    tracing::debug!("Scheduled {} register reads", enqueued);

    enqueued
  }

  /// Never blocks; ids that do not fit are dropped.
  pub(crate) fn enqueue(&self, ids: &[u16]) -> usize {
    let mut enqueued = 0;
    for id in ids {
      match self.sender.try_send(*id) {
        Ok(()) => enqueued += 1,
        Err(flume::TrySendError::Full(id)) => {
          tracing::warn!("Pending read queue is full, dropping {}", id);
          self.metrics.increment(metrics::QUEUE_DROPS);
        }
        Err(flume::TrySendError::Disconnected(id)) => {
          tracing::warn!("Pending read queue is closed, dropping {}", id);
        }
      }
    }

    enqueued
  }

  pub(crate) fn pending(&self) -> usize {
    self.receiver.len()
  }

  fn state_topic(&self, id: u16) -> String {
    format!("{}/registers/{}", self.settings.root_topic, id)
  }

  fn read_response(&self, response: &Response) {
    let ReadResponse { register, value } = match response.read_response() {
      Ok(read) => read,
      Err(error) => {
        tracing::debug!("Malformed read response {}", error);
        return;
      }
    };

    let catalog = self.catalog.snapshot();
    let Some(definition) = catalog.get(register) else {
      tracing::debug!("Read response for unknown register {}", register);
      self.metrics.increment(metrics::UNKNOWN_REGISTERS);
      return;
    };

    let state = definition.decode_display(&value);
    let topic = self.state_topic(register);
    tracing::trace!("Register {} is {}", register, state);
    if let Err(error) =
      self
        .publisher
        .publish(&topic, state.into_bytes(), QoS::AtMostOnce, false)
    {
      tracing::warn!("Failed publishing register {} {}", register, error);
    }

    if let Some(discovery) = &self.settings.discovery {
      if self.announced.insert(register) {
        let announcement = announcement(
          definition,
          &topic,
          discovery,
          catalog.discovery_override(register),
        );
        let published = serde_json::to_vec(&announcement.payload)
          .map_err(|error| error.to_string())
          .and_then(|payload| {
            self
              .publisher
              .publish(&announcement.topic, payload, QoS::AtLeastOnce, true)
              .map_err(|error| error.to_string())
          });
        if let Err(error) = published {
          tracing::warn!("Failed announcing register {} {}", register, error);
          self.announced.remove(&register);
        }
      }
    }

    let raw = i64::from(definition.decode_raw(&value));
    let (name, factor, scale) = match catalog.metric_override(register) {
      Some(metric) => (
        metric
          .name
          .clone()
          .unwrap_or_else(|| metrics::register_metric_name(register)),
        metric.factor.unwrap_or(definition.factor),
        metric.scale.unwrap_or(1),
      ),
      None => (
        metrics::register_metric_name(register),
        definition.factor,
        1,
      ),
    };
    self.metrics.set(&name, raw * i64::from(scale), factor);
  }
}

impl Callback for Gateway {
  fn on_message_received(&self, frame: &[u8]) {
    let response = match Response::parse(frame) {
      Ok(response) => response,
      Err(error) => {
        tracing::debug!("Dropping frame {}", error);
        return;
      }
    };

    tracing::trace!(
      "{:?} from {:?}",
      response.command,
      response.device()
    );
    match response.command {
      Command::ReadResponse => self.read_response(&response),
      Command::Unknown(code) => {
        tracing::info!(
          "Unknown command {:#04X} in {}",
          code,
          format_bytes_as_hex(frame)
        );
      }
      _ => {}
    }
  }

  fn on_read_token_received(&self, out: &mut [u8]) -> usize {
    let Ok(id) = self.receiver.try_recv() else {
      if let Some(started) = self.poll_started.lock().take() {
        let elapsed = started.elapsed().as_millis();
        tracing::debug!("Poll cycle drained in {} ms", elapsed);
        self.metrics.set(
          metrics::POLL_LATENCY,
          i64::try_from(elapsed).unwrap_or(i64::MAX),
          1,
        );
      }
      return 0;
    };

    match ReadRequest::new(id).encode(out) {
      Ok(len) => {
        tracing::trace!("Requesting register {}", id);
        self.metrics.increment(metrics::READ_REQUESTS);
        len
      }
      Err(error) => {
        tracing::warn!("Failed encoding read request for {} {}", id, error);
        0
      }
    }
  }

  fn on_write_token_received(&self, _out: &mut [u8]) -> usize {
    0
  }
}
