use crate::*;

pub(crate) struct Process {
  config: config::Manager,
  services: service::Container,
}

impl Process {
  pub(crate) fn new(
    config: config::Manager,
    services: service::Container,
  ) -> Self {
    Self { config, services }
  }
}

impl super::Process for Process {}

#[async_trait::async_trait]
impl super::Recurring for Process {
  #[tracing::instrument(skip(self))]
  async fn execute(&self) -> anyhow::Result<()> {
    let config = self.config.reload().await;

    // NOTE: a failed load keeps serving the previous catalog
    self.services.nibe().reload_catalog(&config.catalog).await?;

    Ok(())
  }
}
