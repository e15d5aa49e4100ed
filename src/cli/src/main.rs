#![deny(
  unsafe_code,
  // reason = "Let's just not do it"
)]
#![deny(
  clippy::unwrap_used,
  clippy::expect_used,
  clippy::panic,
  clippy::unreachable,
  // reason = "We have to handle errors properly"
)]

mod config;
mod process;
mod service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = config::Manager::new().await?;

  let values = config.values().await;
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::builder()
        .with_default_directive(values.log_level.into())
        .from_env_lossy(),
    )
    .init();

  let services = service::Container::new(values.clone());
  if let Err(error) = services.nibe().reload_catalog(&values.catalog).await {
    tracing::error!("Starting with an empty register catalog {}", error);
  }

  let processes = process::Container::new(config, services);

  processes.spawn().await;
  tokio::signal::ctrl_c().await?;
  processes.cancel().await;

  Ok(())
}
