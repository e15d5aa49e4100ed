use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::service::nibe::Driver;
use crate::*;

const REOPEN_BACKOFF: Duration = Duration::from_secs(5);

pub(crate) struct Process {
  services: service::Container,
}

impl Process {
  pub(crate) fn new(
    _config: config::Manager,
    services: service::Container,
  ) -> Self {
    Self { services }
  }
}

impl super::Process for Process {}

#[async_trait::async_trait]
impl super::Running for Process {
  /// Owns the serial line on a blocking thread and reopens it whenever it
  /// fails.
  async fn run(&self, cancellation: CancellationToken) -> anyhow::Result<()> {
    while !cancellation.is_cancelled() {
      let result = match self.services.serial().open() {
        Ok(port) => {
          let nibe = self.services.nibe();
          let mut driver = Driver::new(port, nibe.gateway().clone(), nibe.ack())
            .with_metrics(nibe.metrics().clone());
          let token = cancellation.clone();

          tokio::task::spawn_blocking(move || driver.run(&token))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|result| result.map_err(anyhow::Error::from))
        }
        Err(error) => Err(error.into()),
      };

      if let Err(error) = result {
        tracing::error!("Protocol driver stopped {}", error);
        tokio::select! {
          _ = cancellation.cancelled() => { },
          _ = tokio::time::sleep(REOPEN_BACKOFF) => { },
        }
      }
    }

    Ok(())
  }
}
