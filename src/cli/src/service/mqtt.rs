use std::sync::Arc;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet};
use tokio_util::sync::CancellationToken;

pub(crate) use rumqttc::QoS;

use crate::*;

const ONLINE: &[u8] = b"online";
const OFFLINE: &[u8] = b"offline";

#[derive(Debug, thiserror::Error)]
pub(crate) enum PublishError {
  #[error("Bus client rejected publish")]
  Client(#[from] rumqttc::ClientError),
}

/// Message bus seam used by the gateway. Publishing only enqueues, so it
/// is safe to call from the driver thread.
pub(crate) trait Publisher: Send + Sync {
  fn publish(
    &self,
    topic: &str,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
  ) -> Result<(), PublishError>;
}

#[derive(Clone)]
pub(crate) struct Service {
  client: AsyncClient,
  eventloop: Arc<tokio::sync::Mutex<EventLoop>>,
  availability_topic: String,
  reconnect_backoff: std::time::Duration,
}

impl service::Service for Service {
  fn new(config: config::Values) -> Self {
    let availability_topic = format!("{}/availability", config.mqtt.root_topic);

    let mut options = MqttOptions::new(
      config.mqtt.client_id,
      config.mqtt.host,
      config.mqtt.port,
    );
    // NOTE: the client rejects keep alive intervals under 5 seconds
    options.set_keep_alive(
      to_std(config.mqtt.keep_alive).max(std::time::Duration::from_secs(5)),
    );
    options.set_last_will(LastWill::new(
      availability_topic.clone(),
      OFFLINE,
      QoS::AtLeastOnce,
      true,
    ));
    if let (Some(username), Some(password)) =
      (config.mqtt.username, config.mqtt.password)
    {
      options.set_credentials(username, password);
    }

    let (client, eventloop) = AsyncClient::new(options, config.mqtt.capacity);

    Self {
      client,
      eventloop: Arc::new(tokio::sync::Mutex::new(eventloop)),
      availability_topic,
      reconnect_backoff: to_std(config.mqtt.reconnect_backoff),
    }
  }
}

impl Publisher for Service {
  fn publish(
    &self,
    topic: &str,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
  ) -> Result<(), PublishError> {
    self.client.try_publish(topic, qos, retain, payload)?;

    Ok(())
  }
}

impl Service {
  /// Drives the connection until cancelled. Every (re)connect announces
  /// availability; failures are retried after the configured back-off.
  #[tracing::instrument(skip_all)]
  pub(crate) async fn run(&self, cancellation: CancellationToken) {
    let mut eventloop = self.eventloop.lock().await;

    loop {
      tokio::select! {
        _ = cancellation.cancelled() => { return; },
        event = eventloop.poll() => match event {
          Ok(Event::Incoming(Packet::ConnAck(_))) => {
            tracing::info!("Connected to message bus");
            if let Err(error) = self.publish(
              &self.availability_topic,
              ONLINE.to_vec(),
              QoS::AtLeastOnce,
              true,
            ) {
              tracing::warn!("Failed announcing availability {}", error);
            }
          }
          Ok(event) => {
            tracing::trace!("Message bus event {:?}", event);
          }
          Err(error) => {
            tracing::error!("Message bus connection failed {}", error);
            tokio::select! {
              _ = cancellation.cancelled() => { return; },
              _ = tokio::time::sleep(self.reconnect_backoff) => { },
            }
          }
        },
      }
    }
  }
}

fn to_std(duration: chrono::Duration) -> std::time::Duration {
  duration.to_std().unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
  use parking_lot::Mutex;

  use super::*;

  #[derive(Debug, Clone, PartialEq, Eq)]
  pub(crate) struct Published {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) retain: bool,
  }

  #[derive(Debug, Default)]
  pub(crate) struct RecordingPublisher {
    pub(crate) published: Mutex<Vec<Published>>,
  }

  impl RecordingPublisher {
    pub(crate) fn take(&self) -> Vec<Published> {
      std::mem::take(&mut *self.published.lock())
    }
  }

  impl Publisher for RecordingPublisher {
    fn publish(
      &self,
      topic: &str,
      payload: Vec<u8>,
      _qos: QoS,
      retain: bool,
    ) -> Result<(), PublishError> {
      self.published.lock().push(Published {
        topic: topic.to_owned(),
        payload,
        retain,
      });
      Ok(())
    }
  }
}
