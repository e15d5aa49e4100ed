mod args;
mod env;
mod file;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::service::nibe;

#[derive(Debug, Clone)]
pub(crate) struct Serial {
  pub(crate) path: String,
  pub(crate) baud_rate: u32,
  pub(crate) read_timeout: chrono::Duration,
  pub(crate) turnaround: chrono::Duration,
  pub(crate) direction_control: bool,
  pub(crate) ack: nibe::AckPolicy,
}

#[derive(Debug, Clone)]
pub(crate) struct Mqtt {
  pub(crate) host: String,
  pub(crate) port: u16,
  pub(crate) username: Option<String>,
  pub(crate) password: Option<String>,
  pub(crate) client_id: String,
  pub(crate) root_topic: String,
  pub(crate) keep_alive: chrono::Duration,
  pub(crate) capacity: usize,
  pub(crate) reconnect_backoff: chrono::Duration,
  pub(crate) discovery: Option<nibe::DiscoverySettings>,
}

#[derive(Debug, Clone)]
pub(crate) struct Catalog {
  pub(crate) path: PathBuf,
  pub(crate) settings: nibe::CatalogSettings,
}

#[derive(Debug, Clone)]
pub(crate) struct Poll {
  pub(crate) fast_interval: chrono::Duration,
  pub(crate) slow_interval: chrono::Duration,
  pub(crate) queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct Metrics {
  pub(crate) enabled: bool,
  pub(crate) address: SocketAddr,
}

#[derive(Debug, Clone)]
pub(crate) struct Values {
  pub(crate) log_level: tracing::level_filters::LevelFilter,
  pub(crate) serial: Serial,
  pub(crate) mqtt: Mqtt,
  pub(crate) catalog: Catalog,
  pub(crate) poll: Poll,
  pub(crate) reload_interval: chrono::Duration,
  pub(crate) metrics: Metrics,
}

#[derive(Debug, Clone)]
struct Unparsed {
  from_args: args::Values,
  from_env: env::Values,
  from_file: file::Values,
}

#[derive(Debug, Clone)]
pub(crate) struct Manager {
  lock: Arc<Mutex<Unparsed>>,
}

#[derive(Debug, Error)]
pub(crate) enum ReadError {
  #[error("Failed reading file")]
  FileReadError(#[from] file::ParseError),

  #[error("Failed reading env")]
  EnvReadError(#[from] env::ParseError),
}

impl Manager {
  pub(crate) async fn new() -> Result<Self, ReadError> {
    let config = Self::read_async().await?;

    Ok(Self::from_unparsed(config))
  }

  fn from_unparsed(config: Unparsed) -> Self {
    Self {
      lock: Arc::new(Mutex::new(config)),
    }
  }

  pub(crate) async fn values(&self) -> Values {
    let config = self.lock.lock().await.clone();

    Self::parse(config)
  }

  /// Re-reads the config file. A file that fails to parse leaves the
  /// previous values in place.
  #[tracing::instrument(skip(self))]
  pub(crate) async fn reload(&self) -> Values {
    let config = {
      let mut values = self.lock.lock().await;
      let from_file =
        file::parse_file(values.from_args.config.as_deref()).await;
      match from_file {
        Ok(from_file) => values.from_file = from_file,
        Err(error) => {
          tracing::error!("Failed parsing config file {}", error)
        }
      }
      values.clone()
    };

    Self::parse(config)
  }

  fn parse(config: Unparsed) -> Values {
    let from_file = config.from_file;
    let from_env = config.from_env;

    Values {
      log_level: from_file.log_level.map_or_else(
        || {
          if config.from_args.trace {
            tracing::level_filters::LevelFilter::TRACE
          } else {
            #[cfg(debug_assertions)]
            {
              tracing::level_filters::LevelFilter::DEBUG
            }
            #[cfg(not(debug_assertions))]
            {
              tracing::level_filters::LevelFilter::INFO
            }
          }
        },
        |log_level| match log_level {
          file::LogLevel::Trace => tracing::level_filters::LevelFilter::TRACE,
          file::LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
          file::LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
          file::LogLevel::Warn => tracing::level_filters::LevelFilter::WARN,
          file::LogLevel::Error => tracing::level_filters::LevelFilter::ERROR,
        },
      ),
      serial: Serial {
        path: from_file
          .serial
          .path
          .unwrap_or("/dev/ttyUSB0".to_owned()),
        baud_rate: from_file.serial.baud_rate.unwrap_or(9600),
        read_timeout: file::milliseconds_to_chrono(
          from_file.serial.read_timeout.unwrap_or(100),
        ),
        turnaround: file::microseconds_to_chrono(
          from_file.serial.turnaround.unwrap_or(500),
        ),
        direction_control: from_file
          .serial
          .direction_control
          .unwrap_or(true),
        ack: nibe::AckPolicy {
          modbus40: from_file.serial.ack.modbus40.unwrap_or(true),
          rmu40: from_file.serial.ack.rmu40.unwrap_or(false),
          sms40: from_file.serial.ack.sms40.unwrap_or(false),
        },
      },
      mqtt: Mqtt {
        host: from_env.mqtt.host,
        port: from_env
          .mqtt
          .port
          .and_then(|port| port.parse::<u16>().ok())
          .unwrap_or(1883),
        username: from_env.mqtt.username,
        password: from_env.mqtt.password,
        client_id: from_env.mqtt.client_id.unwrap_or("nibegw".to_owned()),
        root_topic: from_file
          .mqtt
          .root_topic
          .unwrap_or("nibe".to_owned()),
        keep_alive: file::milliseconds_to_chrono(
          from_file.mqtt.keep_alive.unwrap_or(30_000),
        ),
        capacity: from_file.mqtt.capacity.unwrap_or(256),
        reconnect_backoff: file::milliseconds_to_chrono(
          from_file.mqtt.reconnect_backoff.unwrap_or(5_000),
        ),
        discovery: if from_file.mqtt.discovery.enabled.unwrap_or(true) {
          Some(nibe::DiscoverySettings {
            prefix: from_file
              .mqtt
              .discovery
              .prefix
              .unwrap_or("homeassistant".to_owned()),
            id_prefix: from_file
              .mqtt
              .discovery
              .id_prefix
              .unwrap_or("nibe".to_owned()),
            device_name: from_file.mqtt.discovery.device_name,
          })
        } else {
          None
        },
      },
      catalog: Catalog {
        path: from_file.catalog.path.map_or_else(
          || {
            file::project_dirs().map_or_else(
              || PathBuf::from("registers.csv"),
              |project_dirs| project_dirs.config_dir().join("registers.csv"),
            )
          },
          PathBuf::from,
        ),
        settings: nibe::CatalogSettings {
          retain_all: from_file.catalog.retain_all.unwrap_or(false),
          fast: from_file.catalog.fast,
          slow: from_file.catalog.slow,
          metrics: file::by_register_id("metrics", from_file.catalog.metrics)
            .into_iter()
            .map(|(id, metric)| {
              (
                id,
                nibe::MetricOverride {
                  name: metric.name,
                  factor: metric.factor,
                  scale: metric.scale,
                },
              )
            })
            .collect(),
          discovery: file::by_register_id(
            "discovery",
            from_file.catalog.discovery,
          ),
        },
      },
      poll: Poll {
        fast_interval: file::milliseconds_to_chrono(
          from_file.poll.fast_interval.unwrap_or(10_000),
        ),
        slow_interval: file::milliseconds_to_chrono(
          from_file.poll.slow_interval.unwrap_or(5 * 60 * 1000),
        ),
        queue_capacity: from_file.poll.queue_capacity.unwrap_or(64),
      },
      reload_interval: file::milliseconds_to_chrono(
        from_file.reload_interval.unwrap_or(5 * 60 * 1000),
      ),
      metrics: Metrics {
        enabled: from_file.metrics.enabled.unwrap_or(true),
        address: file::make_socket_address(from_file.metrics.address),
      },
    }
  }

  async fn read_async() -> Result<Unparsed, ReadError> {
    let from_args = args::parse();
    let from_env = env::parse()?;
    let from_file = file::parse_file(from_args.config.as_deref()).await?;

    Ok(Unparsed {
      from_args,
      from_env,
      from_file,
    })
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn unparsed(config: Option<String>) -> Unparsed {
    Unparsed {
      from_args: args::Values {
        config,
        trace: true,
      },
      from_env: env::Values {
        mqtt: env::Mqtt {
          host: "localhost".to_owned(),
          port: Some("not a port".to_owned()),
          username: None,
          password: None,
          client_id: None,
        },
      },
      from_file: file::Values::default(),
    }
  }

  #[tokio::test]
  async fn defaults() {
    let values = Manager::from_unparsed(unparsed(None)).values().await;

    assert_eq!(values.log_level, tracing::level_filters::LevelFilter::TRACE);
    assert_eq!(values.serial.path, "/dev/ttyUSB0");
    assert_eq!(values.serial.baud_rate, 9600);
    assert_eq!(values.serial.turnaround, chrono::Duration::microseconds(500));
    assert_eq!(
      values.serial.ack,
      nibe::AckPolicy {
        modbus40: true,
        rmu40: false,
        sms40: false,
      }
    );
    assert_eq!(values.mqtt.port, 1883);
    assert_eq!(values.mqtt.root_topic, "nibe");
    assert_eq!(
      values.mqtt.discovery.map(|discovery| discovery.prefix),
      Some("homeassistant".to_owned())
    );
    assert_eq!(values.poll.fast_interval, chrono::Duration::seconds(10));
    assert_eq!(values.poll.slow_interval, chrono::Duration::minutes(5));
    assert_eq!(values.poll.queue_capacity, 64);
    assert_eq!(values.metrics.address.port(), 9100);
  }

  #[tokio::test]
  async fn reload_keeps_previous_values_on_failure() -> anyhow::Result<()> {
    let file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    let path = file.path().to_string_lossy().into_owned();
    let manager = Manager::from_unparsed(unparsed(Some(path.clone())));

    tokio::fs::write(&path, "catalog:\n  fast: [40004]\n").await?;
    let values = manager.reload().await;
    assert_eq!(values.catalog.settings.fast, vec![40004]);

    tokio::fs::write(&path, "catalog: [unterminated\n").await?;
    let values = manager.reload().await;
    assert_eq!(values.catalog.settings.fast, vec![40004]);

    tokio::fs::write(&path, "mqtt:\n  discovery:\n    enabled: false\n")
      .await?;
    let values = manager.reload().await;
    assert!(values.catalog.settings.fast.is_empty());
    assert!(values.mqtt.discovery.is_none());
    Ok(())
  }

  #[tokio::test]
  async fn toml_overrides_reach_catalog_settings() -> anyhow::Result<()> {
    let file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    let path = file.path().to_string_lossy().into_owned();
    let manager = Manager::from_unparsed(unparsed(Some(path.clone())));

    tokio::fs::write(
      &path,
      "[catalog]\nfast = [40004]\n\n\
       [catalog.metrics.40004]\nname = \"nibe_outdoor\"\n\n\
       [catalog.discovery.40004]\nicon = \"mdi:thermometer\"\n",
    )
    .await?;
    let values = manager.reload().await;

    assert_eq!(values.catalog.settings.fast, vec![40004]);
    assert_eq!(
      values.catalog.settings.metrics.get(&40004),
      Some(&nibe::MetricOverride {
        name: Some("nibe_outdoor".to_owned()),
        factor: None,
        scale: None,
      })
    );
    assert_eq!(
      values.catalog.settings.discovery.get(&40004),
      Some(&serde_json::json!({ "icon": "mdi:thermometer" }))
    );
    Ok(())
  }
}
