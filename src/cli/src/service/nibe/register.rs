use std::fmt::Display;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub(crate) enum Unit {
  NoUnit,
  Celsius,
  Percent,
  LiterPerMinute,
  KiloPascal,
  Bar,
  RelativeHumidity,
  Rpm,
  Volt,
  Ampere,
  Watt,
  KiloWatt,
  WattHour,
  KiloWattHour,
  Hertz,
  Seconds,
  Minutes,
  Hours,
  Days,
  Months,
  Unknown,
}

// NOTE: utf-8, latin-1, utf-8 read as latin-1 and re-encoded, lossy utf-8
const CELSIUS_VARIANTS: [&[u8]; 4] = [
  b"\xC2\xB0C",
  b"\xB0C",
  b"\xC3\x82\xC2\xB0C",
  b"\xEF\xBF\xBDC",
];

impl Unit {
  pub(crate) fn as_str(self) -> &'static str {
    match self {
      Unit::NoUnit => "",
      Unit::Celsius => "°C",
      Unit::Percent => "%",
      Unit::LiterPerMinute => "l/m",
      Unit::KiloPascal => "kPa",
      Unit::Bar => "bar",
      Unit::RelativeHumidity => "%RH",
      Unit::Rpm => "rpm",
      Unit::Volt => "V",
      Unit::Ampere => "A",
      Unit::Watt => "W",
      Unit::KiloWatt => "kW",
      Unit::WattHour => "Wh",
      Unit::KiloWattHour => "kWh",
      Unit::Hertz => "Hz",
      Unit::Seconds => "s",
      Unit::Minutes => "min",
      Unit::Hours => "h",
      Unit::Days => "days",
      Unit::Months => "months",
      Unit::Unknown => "?",
    }
  }

  /// Unrecognized strings map to [`Unit::Unknown`].
  pub(crate) fn parse(string: &str) -> Unit {
    match string {
      "" => Unit::NoUnit,
      "°C" | "Â°C" | "\u{FFFD}C" => Unit::Celsius,
      "%" => Unit::Percent,
      "l/m" | "l/min" => Unit::LiterPerMinute,
      "kPa" => Unit::KiloPascal,
      "bar" => Unit::Bar,
      "%RH" => Unit::RelativeHumidity,
      "rpm" | "RPM" => Unit::Rpm,
      "V" => Unit::Volt,
      "A" => Unit::Ampere,
      "W" => Unit::Watt,
      "kW" => Unit::KiloWatt,
      "Wh" => Unit::WattHour,
      "kWh" => Unit::KiloWattHour,
      "Hz" => Unit::Hertz,
      "s" => Unit::Seconds,
      "min" => Unit::Minutes,
      "h" => Unit::Hours,
      "days" => Unit::Days,
      "months" => Unit::Months,
      _ => Unit::Unknown,
    }
  }

  /// Like [`Unit::parse`] but also accepts the non utf-8 spellings of
  /// degrees celsius found in older register exports.
  pub(crate) fn from_bytes(bytes: &[u8]) -> Unit {
    if CELSIUS_VARIANTS.contains(&bytes) {
      return Unit::Celsius;
    }

    match std::str::from_utf8(bytes) {
      Ok(string) => Unit::parse(string),
      Err(_) => Unit::Unknown,
    }
  }
}

impl Display for Unit {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub(crate) enum DataType {
  Int8,
  UInt8,
  Int16,
  UInt16,
  Int32,
  UInt32,
  Date,
  Unknown,
}

impl DataType {
  pub(crate) fn from_size_code(code: &str) -> DataType {
    match code {
      "s8" => DataType::Int8,
      "u8" => DataType::UInt8,
      "s16" => DataType::Int16,
      "u16" => DataType::UInt16,
      "s32" => DataType::Int32,
      "u32" => DataType::UInt32,
      _ => DataType::Unknown,
    }
  }

  pub(crate) fn width(self) -> usize {
    match self {
      DataType::Int8 | DataType::UInt8 => 1,
      DataType::Int16 | DataType::UInt16 => 2,
      DataType::Int32 | DataType::UInt32 => 4,
      DataType::Date | DataType::Unknown => 0,
    }
  }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub(crate) enum Mode {
  Read,
  Write,
  ReadWrite,
  Unknown,
}

impl Mode {
  const READ: u8 = 0b01;
  const WRITE: u8 = 0b10;

  pub(crate) fn bits(self) -> u8 {
    match self {
      Mode::Read => Self::READ,
      Mode::Write => Self::WRITE,
      Mode::ReadWrite => Self::READ | Self::WRITE,
      Mode::Unknown => 0,
    }
  }

  pub(crate) fn is_readable(self) -> bool {
    self.bits() & Self::READ != 0
  }

  pub(crate) fn is_writable(self) -> bool {
    self.bits() & Self::WRITE != 0
  }

  pub(crate) fn parse(string: &str) -> Mode {
    match string {
      "R" => Mode::Read,
      "W" => Mode::Write,
      "R/W" => Mode::ReadWrite,
      _ => Mode::Unknown,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Register {
  pub(crate) id: u16,
  pub(crate) title: String,
  #[allow(dead_code, reason = "carried from the export")]
  pub(crate) info: String,
  pub(crate) unit: Unit,
  pub(crate) data_type: DataType,
  pub(crate) factor: i32,
  pub(crate) min_value: i32,
  pub(crate) max_value: i32,
  #[allow(dead_code, reason = "carried from the export")]
  pub(crate) default_value: i32,
  pub(crate) mode: Mode,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum EncodeError {
  #[error("{0:?} is not a number")]
  Invalid(String),

  #[error("{0:?} does not fit the register value range")]
  Overflow(String),
}

/// Sign and width aware read of the low order bytes of a register value.
pub(crate) fn decode_raw(data_type: DataType, bytes: &[u8]) -> i32 {
  let width = data_type.width();
  let Some(bytes) = bytes.get(..width) else {
    tracing::warn!(
      "Register value has {} bytes but {:?} needs {}",
      bytes.len(),
      data_type,
      width
    );
    return 0;
  };

  match data_type {
    DataType::Int8 => i32::from(bytes[0] as i8),
    DataType::UInt8 => i32::from(bytes[0]),
    DataType::Int16 => i32::from(i16::from_le_bytes([bytes[0], bytes[1]])),
    DataType::UInt16 => i32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
    DataType::Int32 => {
      i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
    DataType::UInt32 => {
      u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i32
    }
    DataType::Date => 0,
    DataType::Unknown => {
      tracing::warn!("Cannot decode register value of unknown type");
      0
    }
  }
}

/// Renders `raw / factor` with the implied decimals of the factor.
pub(crate) fn format_fixed(raw: i32, factor: i32) -> String {
  let sign = if raw < 0 { "-" } else { "" };
  let magnitude = raw.unsigned_abs();

  match factor {
    0 | 1 => raw.to_string(),
    10 => format!("{sign}{}.{}", magnitude / 10, magnitude % 10),
    100 => format!("{sign}{}.{:02}", magnitude / 100, magnitude % 100),
    _ => format!("{:.6}", f64::from(raw) / f64::from(factor)),
  }
}

impl Register {
  pub(crate) fn decode_raw(&self, bytes: &[u8]) -> i32 {
    decode_raw(self.data_type, bytes)
  }

  pub(crate) fn decode_display(&self, bytes: &[u8]) -> String {
    if self.data_type == DataType::Date {
      return String::new();
    }

    format_fixed(self.decode_raw(bytes), self.factor)
  }

  #[allow(dead_code, reason = "writes are not forwarded yet")]
  pub(crate) fn encode(&self, string: &str) -> Result<i32, EncodeError> {
    encode_fixed(string, self.factor)
  }

  /// Smallest step of the displayed value.
  pub(crate) fn step(&self) -> f64 {
    if self.factor <= 1 {
      1.0
    } else {
      1.0 / f64::from(self.factor)
    }
  }
}

/// Inverse of [`format_fixed`].
pub(crate) fn encode_fixed(string: &str, factor: i32) -> Result<i32, EncodeError> {
  let trimmed = string.trim();
  let decimals = match factor {
    0 | 1 => Some(0usize),
    10 => Some(1),
    100 => Some(2),
    _ => None,
  };

  if let Some(decimals) = decimals {
    if let Some(value) = encode_implied_decimals(trimmed, decimals)? {
      return Ok(value);
    }
  }

  encode_scaled(trimmed, factor.max(1))
}

// NOTE: returns None when the string has more fraction digits than implied
fn encode_implied_decimals(
  string: &str,
  decimals: usize,
) -> Result<Option<i32>, EncodeError> {
  let invalid = || EncodeError::Invalid(string.to_owned());
  let overflow = || EncodeError::Overflow(string.to_owned());

  let (negative, unsigned) = match string.as_bytes().first() {
    Some(b'-') => (true, &string[1..]),
    Some(b'+') => (false, &string[1..]),
    _ => (false, string),
  };
  let (integer, fraction) = match unsigned.split_once('.') {
    Some((integer, fraction)) => (integer, fraction),
    None => (unsigned, ""),
  };

  if integer.is_empty() && fraction.is_empty() {
    return Err(invalid());
  }
  if !integer.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
    return Err(invalid());
  }
  if fraction.len() > decimals {
    return Ok(None);
  }

  let scale = 10i64.pow(decimals as u32);
  let parse = |digits: &str| -> Result<i64, EncodeError> {
    if digits.is_empty() {
      return Ok(0);
    }
    digits.parse::<i64>().map_err(|_| overflow())
  };

  let whole = parse(integer)?.checked_mul(scale).ok_or_else(overflow)?;
  let padding = 10i64.pow((decimals - fraction.len()) as u32);
  let part = parse(fraction)? * padding;
  let magnitude = whole.checked_add(part).ok_or_else(overflow)?;
  let value = if negative { -magnitude } else { magnitude };

  i32::try_from(value).map(Some).map_err(|_| overflow())
}

fn encode_scaled(string: &str, factor: i32) -> Result<i32, EncodeError> {
  let decimal = Decimal::from_str(string)
    .map_err(|_| EncodeError::Invalid(string.to_owned()))?;

  decimal
    .checked_mul(Decimal::from(factor))
    .map(|scaled| {
      scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
    })
    .and_then(|scaled| scaled.to_i32())
    .ok_or_else(|| EncodeError::Overflow(string.to_owned()))
}
