use std::sync::Arc;

use axum::{extract::State, routing::get, Router};
use tokio_util::sync::CancellationToken;

use crate::service::nibe::Metrics;
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

pub(crate) fn router(metrics: Arc<Metrics>) -> Router {
  Router::new()
    .route("/metrics", get(export))
    .with_state(metrics)
}

async fn export(State(metrics): State<Arc<Metrics>>) -> String {
  metrics.export()
}

#[async_trait::async_trait]
impl super::Running for Process {
  #[tracing::instrument(skip_all)]
  async fn run(&self, cancellation: CancellationToken) -> anyhow::Result<()> {
    let address = self.config.values().await.metrics.address;
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!("Serving metrics on {}", address);

    axum::serve(listener, router(self.services.nibe().metrics().clone()))
      .with_graceful_shutdown(async move { cancellation.cancelled().await })
      .await?;

    Ok(())
  }
}
