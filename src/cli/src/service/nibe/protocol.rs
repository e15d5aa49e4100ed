use itertools::Itertools;

pub(crate) const RESPONSE_START: u8 = 0x5C;
pub(crate) const REQUEST_START: u8 = 0xC0;
pub(crate) const ACK: u8 = 0x06;
pub(crate) const NAK: u8 = 0x15;

// NOTE: some firmwares send this instead of 0x5C when the checksum would
// collide with the response start byte
pub(crate) const CHECKSUM_ALIAS: u8 = 0xC5;

pub(crate) const MAX_FRAME_SIZE: usize = 128;

// NOTE: start | address (2) | command | length
pub(crate) const RESPONSE_HEADER_SIZE: usize = 5;
pub(crate) const READ_REQUEST_SIZE: usize = 6;
pub(crate) const WRITE_REQUEST_SIZE: usize = 10;
pub(crate) const READ_RESPONSE_DATA_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub(crate) enum Command {
  RmuWrite,
  RmuData,
  RmuDataRequest,
  ModbusData,
  ReadToken,
  ReadResponse,
  WriteToken,
  WriteResponse,
  ProductInfo,
  Unknown(u8),
}

impl From<u8> for Command {
  fn from(byte: u8) -> Self {
    match byte {
      0x60 => Command::RmuWrite,
      0x62 => Command::RmuData,
      0x63 => Command::RmuDataRequest,
      0x68 => Command::ModbusData,
      0x69 => Command::ReadToken,
      0x6A => Command::ReadResponse,
      0x6B => Command::WriteToken,
      0x6C => Command::WriteResponse,
      0x6D => Command::ProductInfo,
      other => Command::Unknown(other),
    }
  }
}

impl From<Command> for u8 {
  fn from(command: Command) -> Self {
    match command {
      Command::RmuWrite => 0x60,
      Command::RmuData => 0x62,
      Command::RmuDataRequest => 0x63,
      Command::ModbusData => 0x68,
      Command::ReadToken => 0x69,
      Command::ReadResponse => 0x6A,
      Command::WriteToken => 0x6B,
      Command::WriteResponse => 0x6C,
      Command::ProductInfo => 0x6D,
      Command::Unknown(other) => other,
    }
  }
}

/// Accessory addresses the heat pump talks to.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub(crate) enum Device {
  Sms40,
  Rmu40,
  Modbus40,
}

impl Device {
  pub(crate) fn address(self) -> u16 {
    match self {
      Device::Sms40 => 0x16,
      Device::Rmu40 => 0x19,
      Device::Modbus40 => 0x20,
    }
  }

  pub(crate) fn from_address(address: u16) -> Option<Self> {
    match address {
      0x16 => Some(Device::Sms40),
      0x19 => Some(Device::Rmu40),
      0x20 => Some(Device::Modbus40),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum FrameError {
  #[error("Frame is {actual} bytes but at least {expected} are needed")]
  Truncated { expected: usize, actual: usize },

  #[error("Frame starts with {0:#04X} instead of the expected start byte")]
  Start(u8),

  #[error("Unexpected command {0:?}")]
  Command(Command),

  #[error("Unexpected length field {0}")]
  Length(u8),

  #[error("Checksum {received:#04X} does not match computed {computed:#04X}")]
  Checksum { computed: u8, received: u8 },
}

pub(crate) fn checksum(bytes: &[u8]) -> u8 {
  bytes.iter().fold(0u8, |acc, byte| acc ^ byte)
}

/// Accepts the computed/received pair, including the alias the heat pump
/// sends when the checksum equals the response start byte.
pub(crate) fn checksum_matches(computed: u8, received: u8) -> bool {
  computed == received
    || (computed == RESPONSE_START && received == CHECKSUM_ALIAS)
}

pub(crate) fn format_bytes_as_hex(bytes: &[u8]) -> String {
  bytes.iter().map(|byte| format!("{byte:02X}")).join(" ")
}

fn ensure_len(bytes: &[u8], expected: usize) -> Result<(), FrameError> {
  if bytes.len() < expected {
    return Err(FrameError::Truncated {
      expected,
      actual: bytes.len(),
    });
  }

  Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadRequest {
  pub(crate) register: u16,
}

impl ReadRequest {
  pub(crate) fn new(register: u16) -> Self {
    Self { register }
  }

  pub(crate) fn to_bytes(self) -> [u8; READ_REQUEST_SIZE] {
    let [low, high] = self.register.to_le_bytes();
    let mut bytes = [
      REQUEST_START,
      Command::ReadToken.into(),
      0x02,
      low,
      high,
      0x00,
    ];
    bytes[5] = checksum(&bytes[1..5]);
    bytes
  }

  /// Writes the frame into `out` and returns the number of bytes written.
  pub(crate) fn encode(self, out: &mut [u8]) -> Result<usize, FrameError> {
    ensure_len(out, READ_REQUEST_SIZE)?;
    out[..READ_REQUEST_SIZE].copy_from_slice(&self.to_bytes());
    Ok(READ_REQUEST_SIZE)
  }

  #[allow(dead_code, reason = "only the heat pump decodes requests")]
  pub(crate) fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
    ensure_len(bytes, READ_REQUEST_SIZE)?;
    if bytes[0] != REQUEST_START {
      return Err(FrameError::Start(bytes[0]));
    }
    let command = Command::from(bytes[1]);
    if command != Command::ReadToken {
      return Err(FrameError::Command(command));
    }
    if bytes[2] != 0x02 {
      return Err(FrameError::Length(bytes[2]));
    }
    let computed = checksum(&bytes[1..5]);
    if computed != bytes[5] {
      return Err(FrameError::Checksum {
        computed,
        received: bytes[5],
      });
    }

    Ok(Self {
      register: u16::from_le_bytes([bytes[3], bytes[4]]),
    })
  }
}

#[allow(dead_code, reason = "writes are not forwarded yet")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteRequest {
  pub(crate) register: u16,
  pub(crate) value: [u8; 4],
}

#[allow(dead_code, reason = "writes are not forwarded yet")]
impl WriteRequest {
  pub(crate) fn new(register: u16, value: i32) -> Self {
    Self {
      register,
      value: value.to_le_bytes(),
    }
  }

  pub(crate) fn to_bytes(self) -> [u8; WRITE_REQUEST_SIZE] {
    let [low, high] = self.register.to_le_bytes();
    let mut bytes = [0u8; WRITE_REQUEST_SIZE];
    bytes[0] = REQUEST_START;
    bytes[1] = Command::WriteToken.into();
    bytes[2] = 0x06;
    bytes[3] = low;
    bytes[4] = high;
    bytes[5..9].copy_from_slice(&self.value);
    bytes[9] = checksum(&bytes[1..9]);
    bytes
  }

  pub(crate) fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
    ensure_len(bytes, WRITE_REQUEST_SIZE)?;
    if bytes[0] != REQUEST_START {
      return Err(FrameError::Start(bytes[0]));
    }
    let command = Command::from(bytes[1]);
    if command != Command::WriteToken {
      return Err(FrameError::Command(command));
    }
    if bytes[2] != 0x06 {
      return Err(FrameError::Length(bytes[2]));
    }
    let computed = checksum(&bytes[1..9]);
    if computed != bytes[9] {
      return Err(FrameError::Checksum {
        computed,
        received: bytes[9],
      });
    }

    let mut value = [0u8; 4];
    value.copy_from_slice(&bytes[5..9]);
    Ok(Self {
      register: u16::from_le_bytes([bytes[3], bytes[4]]),
      value,
    })
  }
}

/// A frame sent by the heat pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Response {
  pub(crate) address: u16,
  pub(crate) command: Command,
  pub(crate) data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadResponse {
  pub(crate) register: u16,
  pub(crate) value: [u8; 4],
}

impl Response {
  #[allow(dead_code, reason = "the gateway never answers as the heat pump")]
  pub(crate) fn new(device: Device, command: Command, data: Vec<u8>) -> Self {
    Self {
      address: device.address(),
      command,
      data,
    }
  }

  /// Length of a complete frame once at least the header is available,
  /// `None` while the length field is still missing.
  pub(crate) fn expected_len(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < RESPONSE_HEADER_SIZE + 1 {
      return None;
    }

    Some(RESPONSE_HEADER_SIZE + buffer[4] as usize + 1)
  }

  pub(crate) fn device(&self) -> Option<Device> {
    Device::from_address(self.address)
  }

  #[allow(dead_code, reason = "the gateway never answers as the heat pump")]
  pub(crate) fn to_bytes(&self) -> Vec<u8> {
    let mut bytes =
      Vec::with_capacity(RESPONSE_HEADER_SIZE + self.data.len() + 1);
    bytes.push(RESPONSE_START);
    bytes.extend_from_slice(&self.address.to_be_bytes());
    bytes.push(self.command.into());
    bytes.push(self.data.len() as u8);
    bytes.extend_from_slice(&self.data);
    let sum = checksum(&bytes[1..]);
    bytes.push(sum);
    bytes
  }

  /// Parses a complete frame, honoring the checksum alias.
  pub(crate) fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
    ensure_len(bytes, RESPONSE_HEADER_SIZE + 1)?;
    if bytes[0] != RESPONSE_START {
      return Err(FrameError::Start(bytes[0]));
    }
    let len = bytes[4] as usize;
    let total = RESPONSE_HEADER_SIZE + len + 1;
    ensure_len(bytes, total)?;

    let computed = checksum(&bytes[1..total - 1]);
    let received = bytes[total - 1];
    if !checksum_matches(computed, received) {
      return Err(FrameError::Checksum { computed, received });
    }

    Ok(Self {
      address: u16::from_be_bytes([bytes[1], bytes[2]]),
      command: Command::from(bytes[3]),
      data: bytes[RESPONSE_HEADER_SIZE..total - 1].to_vec(),
    })
  }

  pub(crate) fn read_response(&self) -> Result<ReadResponse, FrameError> {
    if self.command != Command::ReadResponse {
      return Err(FrameError::Command(self.command));
    }
    ensure_len(&self.data, READ_RESPONSE_DATA_SIZE)?;

    let mut value = [0u8; 4];
    value.copy_from_slice(&self.data[2..6]);
    Ok(ReadResponse {
      register: u16::from_le_bytes([self.data[0], self.data[1]]),
      value,
    })
  }
}

/// True for the zero-length read/write offers the heat pump sends to the
/// MODBUS40 address.
pub(crate) fn token_command(buffer: &[u8]) -> Option<Command> {
  if buffer.len() < RESPONSE_HEADER_SIZE
    || buffer[0] != RESPONSE_START
    || buffer[1] != 0x00
    || u16::from(buffer[2]) != Device::Modbus40.address()
    || buffer[4] != 0x00
  {
    return None;
  }

  match Command::from(buffer[3]) {
    command @ (Command::ReadToken | Command::WriteToken) => Some(command),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn checksum_folds_with_xor() {
    let left = [0x00, 0x20, 0x6A];
    let right = [0x06, 0x04, 0x9C, 0xFF];
    let joined = [left.as_slice(), right.as_slice()].concat();

    assert_eq!(checksum(&[]), 0);
    assert_eq!(checksum(&joined), checksum(&left) ^ checksum(&right));
    assert_eq!(checksum(&[0x00, 0x20, 0x69, 0x00]), 0x49);
  }

  #[test]
  fn checksum_alias_is_only_accepted_for_start_byte() {
    assert!(checksum_matches(0x12, 0x12));
    assert!(checksum_matches(RESPONSE_START, CHECKSUM_ALIAS));
    assert!(checksum_matches(RESPONSE_START, RESPONSE_START));
    assert!(!checksum_matches(RESPONSE_START, 0xC4));
    assert!(!checksum_matches(0x12, CHECKSUM_ALIAS));
  }

  #[test]
  fn hex_formatting() {
    assert_eq!(format_bytes_as_hex(&[]), "");
    assert_eq!(format_bytes_as_hex(&[0x5C]), "5C");
    assert_eq!(format_bytes_as_hex(&[0x5C, 0x00, 0xab]), "5C 00 AB");
  }

  #[test]
  fn read_request_layout() {
    let bytes = ReadRequest::new(40004).to_bytes();

    assert_eq!(bytes[..5], [0xC0, 0x69, 0x02, 0x44, 0x9C]);
    assert_eq!(bytes[5], 0x69 ^ 0x02 ^ 0x44 ^ 0x9C);
    assert_eq!(ReadRequest::parse(&bytes), Ok(ReadRequest::new(40004)));
  }

  #[test]
  fn read_request_encode_needs_room() {
    let mut small = [0u8; 4];
    let mut exact = [0u8; READ_REQUEST_SIZE];

    assert!(matches!(
      ReadRequest::new(1).encode(&mut small),
      Err(FrameError::Truncated { .. })
    ));
    assert_eq!(ReadRequest::new(1).encode(&mut exact), Ok(READ_REQUEST_SIZE));
  }

  #[test]
  fn write_request_layout() {
    let request = WriteRequest::new(47398, -15);
    let bytes = request.to_bytes();

    assert_eq!(bytes[..3], [0xC0, 0x6B, 0x06]);
    assert_eq!(bytes[5..9], (-15i32).to_le_bytes());
    assert_eq!(WriteRequest::parse(&bytes), Ok(request));
  }

  #[test]
  fn response_round_trip() {
    let response = Response::new(
      Device::Modbus40,
      Command::ReadResponse,
      vec![0x44, 0x9C, 0xC8, 0x00, 0x00, 0x00],
    );
    let bytes = response.to_bytes();

    assert_eq!(bytes[..5], [0x5C, 0x00, 0x20, 0x6A, 0x06]);
    assert_eq!(Response::expected_len(&bytes), Some(bytes.len()));
    assert_eq!(Response::parse(&bytes), Ok(response.clone()));
    assert_eq!(
      response.read_response(),
      Ok(ReadResponse {
        register: 40004,
        value: [0xC8, 0x00, 0x00, 0x00],
      })
    );
  }

  #[test]
  fn response_rejects_bad_checksum() {
    let mut bytes =
      Response::new(Device::Rmu40, Command::RmuData, vec![1, 2, 3]).to_bytes();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;

    assert!(matches!(
      Response::parse(&bytes),
      Err(FrameError::Checksum { .. })
    ));
  }

  #[test]
  fn read_response_needs_full_payload() {
    let response =
      Response::new(Device::Modbus40, Command::ReadResponse, vec![0x01]);

    assert!(matches!(
      response.read_response(),
      Err(FrameError::Truncated { .. })
    ));
  }

  #[test]
  fn tokens_are_recognized() {
    assert_eq!(
      token_command(&[0x5C, 0x00, 0x20, 0x69, 0x00, 0x49]),
      Some(Command::ReadToken)
    );
    assert_eq!(
      token_command(&[0x5C, 0x00, 0x20, 0x6B, 0x00, 0x4B]),
      Some(Command::WriteToken)
    );
    assert_eq!(token_command(&[0x5C, 0x00, 0x19, 0x69, 0x00, 0x70]), None);
    assert_eq!(token_command(&[0x5C, 0x00, 0x20, 0x6A, 0x06]), None);
  }
}
