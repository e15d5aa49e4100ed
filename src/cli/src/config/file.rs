use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// NITPICK: optional values here with #[serde(default = ...)]

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Ack {
  pub(crate) modbus40: Option<bool>,
  pub(crate) rmu40: Option<bool>,
  pub(crate) sms40: Option<bool>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Serial {
  pub(crate) path: Option<String>,
  pub(crate) baud_rate: Option<u32>,
  pub(crate) read_timeout: Option<u32>,
  pub(crate) turnaround: Option<u32>,
  pub(crate) direction_control: Option<bool>,
  #[serde(default)]
  pub(crate) ack: Ack,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Discovery {
  pub(crate) enabled: Option<bool>,
  pub(crate) prefix: Option<String>,
  pub(crate) id_prefix: Option<String>,
  pub(crate) device_name: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Mqtt {
  pub(crate) root_topic: Option<String>,
  pub(crate) keep_alive: Option<u32>,
  pub(crate) capacity: Option<usize>,
  pub(crate) reconnect_backoff: Option<u32>,
  #[serde(default)]
  pub(crate) discovery: Discovery,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MetricOverride {
  pub(crate) name: Option<String>,
  pub(crate) factor: Option<i32>,
  pub(crate) scale: Option<i32>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Catalog {
  pub(crate) path: Option<String>,
  pub(crate) retain_all: Option<bool>,
  #[serde(default)]
  pub(crate) fast: Vec<u16>,
  #[serde(default)]
  pub(crate) slow: Vec<u16>,
  #[serde(default)]
  pub(crate) metrics: HashMap<String, MetricOverride>,
  #[serde(default)]
  pub(crate) discovery: HashMap<String, serde_json::Value>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Poll {
  pub(crate) fast_interval: Option<u32>,
  pub(crate) slow_interval: Option<u32>,
  pub(crate) queue_capacity: Option<usize>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Metrics {
  pub(crate) enabled: Option<bool>,
  pub(crate) address: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Values {
  pub(crate) log_level: Option<LogLevel>,
  #[serde(default)]
  pub(crate) serial: Serial,
  #[serde(default)]
  pub(crate) mqtt: Mqtt,
  #[serde(default)]
  pub(crate) catalog: Catalog,
  #[serde(default)]
  pub(crate) poll: Poll,
  pub(crate) reload_interval: Option<u32>,
  #[serde(default)]
  pub(crate) metrics: Metrics,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseError {
  #[error("Failed creating project directories")]
  MissingProjectDirs,

  #[error("Failed reading config file")]
  Read(#[from] std::io::Error),

  #[error("Config file is missing an extension")]
  MissingExtension,

  #[error("Config file has invalid extension")]
  InvalidExtension,

  #[error("Failed deserializing config from yaml")]
  DeserializetionYaml(#[from] serde_yaml::Error),

  #[error("Failed deserializing config from toml")]
  DeserializetionToml(#[from] toml::de::Error),

  #[error("Failed deserializing config from json")]
  DeserializetionJson(#[from] serde_json::Error),
}

pub(crate) fn project_dirs() -> Option<directories::ProjectDirs> {
  directories::ProjectDirs::from("com", "nibegw", "nibegw")
}

pub(crate) async fn parse_file(
  location: Option<&str>,
) -> Result<Values, ParseError> {
  let location = match location {
    Some(location) => std::path::PathBuf::from(location),
    None => match project_dirs() {
      Some(project_dirs) => project_dirs.config_dir().join("config.yaml"),
      None => return Err(ParseError::MissingProjectDirs),
    },
  };

  let raw = tokio::fs::read_to_string(location.clone()).await?;
  let extension = location.extension().and_then(|str| str.to_str());

  parse_str(extension, raw.as_str())
}

pub(crate) fn parse_str(
  extension: Option<&str>,
  raw: &str,
) -> Result<Values, ParseError> {
  let values = match extension {
    None => return Err(ParseError::MissingExtension),
    Some("yaml" | "yml") => serde_yaml::from_str::<Values>(raw)?,
    Some("toml") => toml::from_str::<Values>(raw)?,
    Some("json") => serde_json::from_str::<Values>(raw)?,
    Some(_) => return Err(ParseError::InvalidExtension),
  };

  Ok(values)
}

pub(crate) fn milliseconds_to_chrono(milliseconds: u32) -> chrono::Duration {
  chrono::Duration::milliseconds(milliseconds as i64)
}

pub(crate) fn microseconds_to_chrono(microseconds: u32) -> chrono::Duration {
  chrono::Duration::microseconds(microseconds as i64)
}

pub(crate) fn make_socket_address(
  address: Option<String>,
) -> std::net::SocketAddr {
  let default = std::net::SocketAddr::from(([0, 0, 0, 0], 9100));
  match address {
    Some(address) => match address.parse() {
      Ok(address) => address,
      Err(error) => {
        tracing::warn!("Invalid metrics address {} {}", address, error);
        default
      }
    },
    None => default,
  }
}

/// Map keys are register ids but toml and json only have string keys.
pub(crate) fn by_register_id<T>(
  section: &str,
  map: HashMap<String, T>,
) -> HashMap<u16, T> {
  map
    .into_iter()
    .filter_map(|(key, value)| match key.trim().parse::<u16>() {
      Ok(id) => Some((id, value)),
      Err(error) => {
        tracing::warn!(
          "Ignoring {} override for invalid register id {} {}",
          section,
          key,
          error
        );
        None
      }
    })
    .collect()
}
