use serde_json::{json, Map, Value};

use super::register::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiscoverySettings {
  pub(crate) prefix: String,
  pub(crate) id_prefix: String,
  pub(crate) device_name: Option<String>,
}

impl Default for DiscoverySettings {
  fn default() -> Self {
    Self {
      prefix: "homeassistant".to_owned(),
      id_prefix: "nibe".to_owned(),
      device_name: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Announcement {
  pub(crate) topic: String,
  pub(crate) payload: Value,
}

/// Home Assistant grouping of a unit as `(device_class, state_class)`.
fn unit_class(unit: Unit) -> Option<(Option<&'static str>, &'static str)> {
  let class = match unit {
    Unit::NoUnit | Unit::Unknown => return None,
    Unit::Celsius => (Some("temperature"), "measurement"),
    Unit::Seconds | Unit::Minutes | Unit::Hours | Unit::Days => {
      (Some("duration"), "measurement")
    }
    Unit::Watt | Unit::KiloWatt => (Some("power"), "measurement"),
    Unit::WattHour | Unit::KiloWattHour => {
      (Some("energy"), "total_increasing")
    }
    Unit::Hertz => (Some("frequency"), "measurement"),
    _ => (None, "measurement"),
  };

  Some(class)
}

fn scaled(raw: i32, factor: i32) -> Value {
  if factor <= 1 {
    json!(raw)
  } else {
    json!(f64::from(raw) / f64::from(factor))
  }
}

/// Builds the retained auto-configuration message for a register.
pub(crate) fn announcement(
  register: &Register,
  state_topic: &str,
  settings: &DiscoverySettings,
  extra: Option<&Value>,
) -> Announcement {
  let object_id = format!("{}-{}", settings.id_prefix, register.id);
  let writable = register.mode.is_writable();

  let mut payload = Map::new();
  payload.insert("obj_id".to_owned(), json!(object_id));
  payload.insert("uniq_id".to_owned(), json!(object_id));
  payload.insert("name".to_owned(), json!(register.title));
  payload.insert("stat_t".to_owned(), json!(state_topic));

  if writable {
    payload.insert("cmd_t".to_owned(), json!(format!("{state_topic}/set")));
    payload.insert(
      "min".to_owned(),
      scaled(register.min_value, register.factor),
    );
    payload.insert(
      "max".to_owned(),
      scaled(register.max_value, register.factor),
    );
    payload.insert("step".to_owned(), json!(register.step()));
  }

  if let Some((device_class, state_class)) = unit_class(register.unit) {
    payload.insert("unit_of_meas".to_owned(), json!(register.unit.as_str()));
    if let Some(device_class) = device_class {
      payload.insert("device_class".to_owned(), json!(device_class));
    }
    payload.insert("state_class".to_owned(), json!(state_class));
  }

  if let Some(device_name) = &settings.device_name {
    payload.insert(
      "dev".to_owned(),
      json!({
        "ids": [settings.id_prefix],
        "name": device_name,
        "mf": "NIBE",
      }),
    );
  }

  if let Some(Value::Object(extra)) = extra {
    merge(&mut payload, extra);
  }

  let component = if writable { "number" } else { "sensor" };
  Announcement {
    topic: format!(
      "{}/{}/{}/{}/config",
      settings.prefix, component, settings.id_prefix, object_id
    ),
    payload: Value::Object(payload),
  }
}

/// Null values delete the key, everything else replaces it.
fn merge(payload: &mut Map<String, Value>, extra: &Map<String, Value>) {
  for (key, value) in extra {
    if value.is_null() {
      payload.remove(key);
    } else {
      payload.insert(key.clone(), value.clone());
    }
  }
}
