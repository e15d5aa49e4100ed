use crate::service::nibe::Cadence;
use crate::*;

pub(crate) struct Process {
  services: service::Container,
  cadence: Cadence,
}

impl Process {
  pub(crate) fn new(
    _config: config::Manager,
    services: service::Container,
    cadence: Cadence,
  ) -> Self {
    Self { services, cadence }
  }
}

impl super::Process for Process {}

#[async_trait::async_trait]
impl super::Recurring for Process {
  #[tracing::instrument(skip(self), fields(cadence = ?self.cadence))]
  async fn execute(&self) -> anyhow::Result<()> {
    let gateway = self.services.nibe().gateway();
    let backlog = gateway.pending();
    if backlog > 0 {
      tracing::debug!("{} reads still pending from the last cycle", backlog);
    }

    gateway.schedule_poll(self.cadence);

    Ok(())
  }
}
