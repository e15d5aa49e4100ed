mod connection;
mod driver;
mod export;
mod poll;
mod reload;

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::service::nibe::Cadence;
use crate::{config, service};

pub(crate) trait Process {
  fn process_name(&self) -> &'static str {
    std::any::type_name::<Self>()
  }
}

#[async_trait::async_trait]
pub(crate) trait Recurring: Process {
  async fn execute(&self) -> anyhow::Result<()>;
}

/// Runs until the token is cancelled.
#[async_trait::async_trait]
pub(crate) trait Running: Process {
  async fn run(&self, cancellation: CancellationToken) -> anyhow::Result<()>;
}

pub(crate) struct Container {
  config: config::Manager,
  services: service::Container,
  handles: Arc<Mutex<Option<Vec<Handle>>>>,
}

impl Container {
  pub(crate) fn new(
    config: config::Manager,
    services: service::Container,
  ) -> Self {
    Self {
      config,
      services,
      handles: Arc::new(Mutex::new(None)),
    }
  }

  pub(crate) async fn cancel(&self) {
    {
      let mut handles = self.handles.clone().lock_owned().await;
      if let Some(handles) = &mut *handles {
        for handle in handles.iter() {
          handle.token.cancel();
        }

        for handle in handles.drain(0..) {
          if let Err(error) = handle.join.await {
            tracing::error! {
              %error,
              "Joining process handle on cancel failed"
            }
          }
        }
      }
      *handles = None;
    }
  }
}

macro_rules! make_recurring_spec {
  ($self: ident, $type: ty, $interval: expr $(, $arg: expr)*) => {
    RecurringSpec {
      process: Box::new(<$type>::new(
        $self.config.clone(),
        $self.services.clone(),
        $($arg),*
      )),
      interval: $interval,
    }
  };
}

macro_rules! make_running_spec {
  ($self: ident, $type: ty) => {
    RunningSpec {
      process: Box::new(<$type>::new(
        $self.config.clone(),
        $self.services.clone(),
      )),
    }
  };
}

impl Container {
  pub(crate) async fn spawn(&self) {
    let config = self.config.values().await;
    let recurring = vec![
      make_recurring_spec!(
        self,
        poll::Process,
        config.poll.fast_interval,
        Cadence::Fast
      ),
      make_recurring_spec!(
        self,
        poll::Process,
        config.poll.slow_interval,
        Cadence::Slow
      ),
      make_recurring_spec!(self, reload::Process, config.reload_interval),
    ];

    let mut running = vec![
      make_running_spec!(self, connection::Process),
      make_running_spec!(self, driver::Process),
    ];
    if config.metrics.enabled {
      running.push(make_running_spec!(self, export::Process));
    }

    {
      let mut handles = self.handles.clone().lock_owned().await;
      *handles = Some(
        recurring
          .into_iter()
          .map(Handle::recurring)
          .chain(running.into_iter().map(Handle::running))
          .collect(),
      );
    }
  }
}

struct Handle {
  token: CancellationToken,
  join: tokio::task::JoinHandle<()>,
}

struct RecurringSpec {
  process: Box<dyn Recurring + Sync + Send>,
  interval: chrono::Duration,
}

struct RunningSpec {
  process: Box<dyn Running + Sync + Send>,
}

impl Handle {
  fn recurring(spec: RecurringSpec) -> Self {
    let token = CancellationToken::new();
    let child_token = token.child_token();
    let join = tokio::spawn(async move {
      let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(
          spec.interval.num_milliseconds().max(1) as u64,
        ));
      loop {
        tokio::select! {
            _ = child_token.cancelled() => { return; },
            _ = async {
                interval.tick().await;

                if let Err(error) = spec.process.execute().await {
                  tracing::error!(
                    "Process execution failed {} for {}",
                    error,
                    spec.process.process_name()
                  );
                }
            } => { }
        }
      }
    });
    Self { token, join }
  }

  fn running(spec: RunningSpec) -> Self {
    let token = CancellationToken::new();
    let child_token = token.child_token();
    let join = tokio::spawn(async move {
      if let Err(error) = spec.process.run(child_token).await {
        tracing::error!(
          "Process failed {} for {}",
          error,
          spec.process.process_name()
        );
      }
    });
    Self { token, join }
  }
}
