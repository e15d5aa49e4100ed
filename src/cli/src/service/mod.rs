pub mod mqtt;
pub mod nibe;
pub mod serial;

use std::sync::Arc;

use crate::*;

pub trait Service {
  fn new(config: config::Values) -> Self;
}

#[derive(Clone)]
pub(crate) struct Container {
  serial: serial::Service,
  mqtt: mqtt::Service,
  nibe: nibe::Service,
}

impl Container {
  pub(crate) fn new(config: config::Values) -> Self {
    let mqtt = <mqtt::Service as Service>::new(config.clone());
    let nibe = nibe::Service::new(config.clone(), Arc::new(mqtt.clone()));

    Self {
      serial: <serial::Service as Service>::new(config),
      mqtt,
      nibe,
    }
  }

  pub(crate) fn serial(&self) -> &serial::Service {
    &self.serial
  }

  pub(crate) fn mqtt(&self) -> &mqtt::Service {
    &self.mqtt
  }

  pub(crate) fn nibe(&self) -> &nibe::Service {
    &self.nibe
  }
}
