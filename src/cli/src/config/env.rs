#[derive(Debug, Clone)]
pub(crate) struct Mqtt {
  pub(crate) host: String,
  pub(crate) port: Option<String>,
  pub(crate) username: Option<String>,
  pub(crate) password: Option<String>,
  pub(crate) client_id: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Values {
  pub(crate) mqtt: Mqtt,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseError {
  #[error("Failed reading env var")]
  EnvVarRead(#[from] std::env::VarError),
}

pub(crate) fn parse() -> Result<Values, ParseError> {
  let _ = dotenv::dotenv();

  let values = Values {
    mqtt: Mqtt {
      host: std::env::var("NIBEGW_MQTT_HOST")?,
      port: std::env::var("NIBEGW_MQTT_PORT").ok(),
      username: std::env::var("NIBEGW_MQTT_USERNAME").ok(),
      password: std::env::var("NIBEGW_MQTT_PASSWORD").ok(),
      client_id: std::env::var("NIBEGW_MQTT_CLIENT_ID").ok(),
    },
  };

  Ok(values)
}
