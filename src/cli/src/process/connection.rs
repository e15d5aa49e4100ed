use tokio_util::sync::CancellationToken;

use crate::*;

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
  async fn run(&self, cancellation: CancellationToken) -> anyhow::Result<()> {
    self.services.mqtt().run(cancellation).await;

    Ok(())
  }
}
