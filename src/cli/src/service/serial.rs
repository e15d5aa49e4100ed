use std::io::{Read, Write};
use std::time::Duration;

use itertools::Itertools;

use crate::service::nibe::{Transport, TransportError};
use crate::*;

#[derive(Debug, Clone)]
pub(crate) struct Service {
  path: String,
  baud_rate: u32,
  read_timeout: Duration,
  turnaround: Duration,
  direction_control: bool,
}

impl service::Service for Service {
  fn new(config: config::Values) -> Self {
    Self {
      path: config.serial.path,
      baud_rate: config.serial.baud_rate,
      read_timeout: config.serial.read_timeout.to_std().unwrap_or_default(),
      turnaround: config.serial.turnaround.to_std().unwrap_or_default(),
      direction_control: config.serial.direction_control,
    }
  }
}

#[derive(Debug, Clone)]
pub(crate) struct SerialPort {
  pub(crate) path: String,
  pub(crate) kind: String,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum OpenError {
  #[error("Failed opening serial port")]
  Open(#[from] serialport::Error),

  #[error("Failed releasing line driver")]
  Transport(#[from] TransportError),
}

impl Service {
  pub(crate) fn scan_serial(&self) -> Vec<SerialPort> {
    let available = match serialport::available_ports() {
      Ok(available) => available,
      Err(_) => return Vec::new(),
    };

    available
      .into_iter()
      .map(|port| SerialPort {
        path: port.port_name,
        kind: match port.port_type {
          serialport::SerialPortType::UsbPort(_) => "usb",
          serialport::SerialPortType::PciPort => "pci",
          serialport::SerialPortType::BluetoothPort => "bluetooth",
          serialport::SerialPortType::Unknown => "unknown",
        }
        .to_owned(),
      })
      .collect::<Vec<_>>()
  }

  #[tracing::instrument(skip(self))]
  pub(crate) fn open(&self) -> Result<Port, OpenError> {
    let port = match serialport::new(&self.path, self.baud_rate)
      .data_bits(serialport::DataBits::Eight)
      .parity(serialport::Parity::None)
      .stop_bits(serialport::StopBits::One)
      .flow_control(serialport::FlowControl::None)
      .timeout(self.read_timeout)
      .open()
    {
      Ok(port) => port,
      Err(error) => {
        tracing::error!(
          "Failed opening {} available ports are {}",
          self.path,
          self
            .scan_serial()
            .into_iter()
            .map(|port| format!("{} ({})", port.path, port.kind))
            .join(", ")
        );
        return Err(error.into());
      }
    };

    let mut port = Port {
      port,
      turnaround: self.turnaround,
      direction_control: self.direction_control,
    };
    port.end_transmit()?;

    tracing::info!("Opened {} at {} baud", self.path, self.baud_rate);

    Ok(port)
  }
}

/// RS-485 line with the driver enable wired to RTS.
pub(crate) struct Port {
  port: Box<dyn serialport::SerialPort>,
  turnaround: Duration,
  direction_control: bool,
}

impl Transport for Port {
  fn bytes_available(&mut self) -> Result<bool, TransportError> {
    let available = self
      .port
      .bytes_to_read()
      .map_err(std::io::Error::from)?;

    Ok(available > 0)
  }

  fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
    let mut byte = [0u8; 1];
    match self.port.read(&mut byte) {
      Ok(1) => Ok(Some(byte[0])),
      Ok(_) => Ok(None),
      Err(error) if error.kind() == std::io::ErrorKind::TimedOut => Ok(None),
      Err(error) => Err(error.into()),
    }
  }

  fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
    self.port.write_all(bytes)?;

    Ok(())
  }

  fn flush(&mut self) -> Result<(), TransportError> {
    self.port.flush()?;

    Ok(())
  }

  fn begin_transmit(&mut self) -> Result<(), TransportError> {
    if self.direction_control {
      self
        .port
        .write_request_to_send(true)
        .map_err(std::io::Error::from)?;
    }

    Ok(())
  }

  fn end_transmit(&mut self) -> Result<(), TransportError> {
    if self.direction_control {
      // NOTE: the last stop bit may still be in the UART after flush
      std::thread::sleep(self.turnaround);
      self
        .port
        .write_request_to_send(false)
        .map_err(std::io::Error::from)?;
    }

    Ok(())
  }
}
