use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use super::register::*;

pub(crate) const SIGNATURE: &str = "ModbusManager";
pub(crate) const COLUMNS: &str =
  "Title;Info;ID;Unit;Size;Factor;Min;Max;Default;Mode";

const HEADER_LINES: usize = 5;
const DELIMITER: u8 = b';';
const QUOTE: u8 = b'"';
const BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
  pub(crate) text: Vec<u8>,
  pub(crate) quoted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum TokenizeError {
  #[error("Quoted field starting at {0} is not terminated")]
  Unterminated(usize),

  #[error("Unexpected character after quoted field at {0}")]
  Trailing(usize),
}

/// Splits one line on `;` honoring `"..."` quoting with `""` escapes.
#[derive(Debug, Clone)]
pub(crate) struct Tokenizer<'a> {
  line: &'a [u8],
  position: usize,
}

impl<'a> Tokenizer<'a> {
  pub(crate) fn new(line: &'a [u8]) -> Self {
    Self { line, position: 0 }
  }

  /// `Ok(None)` once the line is exhausted. A delimiter at the very end of
  /// the line does not produce a trailing empty token.
  pub(crate) fn next_token(&mut self) -> Result<Option<Token>, TokenizeError> {
    if self.position >= self.line.len() {
      return Ok(None);
    }

    if self.line[self.position] == QUOTE {
      return self.quoted().map(Some);
    }

    let rest = &self.line[self.position..];
    let end = rest
      .iter()
      .position(|byte| *byte == DELIMITER)
      .unwrap_or(rest.len());
    self.position += end + 1;

    Ok(Some(Token {
      text: rest[..end].to_vec(),
      quoted: false,
    }))
  }

  fn quoted(&mut self) -> Result<Token, TokenizeError> {
    let start = self.position;
    let mut text = Vec::new();
    let mut index = start + 1;

    loop {
      match self.line.get(index) {
        None => return Err(TokenizeError::Unterminated(start)),
        Some(&QUOTE) if self.line.get(index + 1) == Some(&QUOTE) => {
          text.push(QUOTE);
          index += 2;
        }
        Some(&QUOTE) => {
          index += 1;
          break;
        }
        Some(byte) => {
          text.push(*byte);
          index += 1;
        }
      }
    }

    match self.line.get(index) {
      None => self.position = index,
      Some(&DELIMITER) => self.position = index + 1,
      Some(_) => return Err(TokenizeError::Trailing(index)),
    }

    Ok(Token { text, quoted: true })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum CatalogParseError {
  #[error("Register export ended inside the header")]
  MissingHeader,

  #[error("Register export does not start with {SIGNATURE:?}")]
  Signature,

  #[error("Unexpected column header {0:?}")]
  Columns(String),

  #[error("Invalid field {field} on line {line}")]
  Field { line: usize, field: usize },

  #[error("Register {id} on line {line} is already defined")]
  DuplicateId { line: usize, id: u16 },
}

/// Parses a register export. Registers whose id passes `filter` are
/// inserted into `output`; without an output only the syntax is checked.
/// Returns the number of registers in the export.
pub(crate) fn parse_catalog<TFilter: Fn(u16) -> bool>(
  input: &[u8],
  mut output: Option<&mut BTreeMap<u16, Register>>,
  filter: TFilter,
) -> Result<usize, CatalogParseError> {
  let input = input.strip_prefix(BOM).unwrap_or(input);
  let mut lines = input
    .split(|byte| *byte == b'\n')
    .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
    .enumerate()
    .map(|(index, line)| (index + 1, line));

  let header = lines.by_ref().take(HEADER_LINES).collect::<Vec<_>>();
  validate_header(&header)?;

  let mut seen = HashSet::new();
  for (number, line) in lines {
    if line.is_empty() {
      continue;
    }

    let register = parse_line(line).map_err(|field| {
      CatalogParseError::Field {
        line: number,
        field,
      }
    })?;

    if !seen.insert(register.id) {
      return Err(CatalogParseError::DuplicateId {
        line: number,
        id: register.id,
      });
    }

    if let Some(output) = output.as_deref_mut() {
      if filter(register.id) {
        output.insert(register.id, register);
      }
    }
  }

  Ok(seen.len())
}

fn validate_header(header: &[(usize, &[u8])]) -> Result<(), CatalogParseError> {
  if header.len() < HEADER_LINES {
    return Err(CatalogParseError::MissingHeader);
  }

  let (_, signature) = header[0];
  if !signature.starts_with(SIGNATURE.as_bytes()) {
    return Err(CatalogParseError::Signature);
  }

  let (_, columns) = header[HEADER_LINES - 1];
  if columns != COLUMNS.as_bytes() {
    return Err(CatalogParseError::Columns(decode_text(columns)));
  }

  Ok(())
}

/// Reads the fields of one line in order and reports the 1-based index of
/// the first one that is missing or invalid.
struct Fields<'a> {
  tokenizer: Tokenizer<'a>,
  index: usize,
}

impl<'a> Fields<'a> {
  fn next(&mut self) -> Result<Token, usize> {
    self.index += 1;
    match self.tokenizer.next_token() {
      Ok(Some(token)) => Ok(token),
      _ => Err(self.index),
    }
  }

  fn quoted(&mut self) -> Result<Vec<u8>, usize> {
    let token = self.next()?;
    if !token.quoted {
      return Err(self.index);
    }
    Ok(token.text)
  }

  fn plain(&mut self) -> Result<String, usize> {
    let token = self.next()?;
    String::from_utf8(token.text).map_err(|_| self.index)
  }

  fn number<T: FromStr>(&mut self) -> Result<T, usize> {
    self.plain()?.parse::<T>().map_err(|_| self.index)
  }
}

fn parse_line(line: &[u8]) -> Result<Register, usize> {
  let mut fields = Fields {
    tokenizer: Tokenizer::new(line),
    index: 0,
  };

  let title = fields.quoted()?;
  if title.is_empty() {
    return Err(fields.index);
  }
  let info = fields.quoted()?;
  let id = fields.number::<u16>()?;

  let unit = Unit::from_bytes(&fields.quoted()?);
  if unit == Unit::Unknown {
    return Err(fields.index);
  }

  let data_type = DataType::from_size_code(&fields.plain()?);
  if data_type == DataType::Unknown {
    return Err(fields.index);
  }

  let factor = fields.number::<i32>()?;
  let min_value = fields.number::<i32>()?;
  let max_value = fields.number::<i32>()?;
  let default_value = fields.number::<i32>()?;

  let mode = Mode::parse(&fields.plain()?);
  if mode == Mode::Unknown {
    return Err(fields.index);
  }

  Ok(Register {
    id,
    title: decode_text(&title),
    info: decode_text(&info),
    unit,
    data_type,
    factor,
    min_value,
    max_value,
    default_value,
    mode,
  })
}

// NOTE: exports are either utf-8 or latin-1
fn decode_text(bytes: &[u8]) -> String {
  match std::str::from_utf8(bytes) {
    Ok(text) => text.to_owned(),
    Err(_) => bytes.iter().map(|byte| char::from(*byte)).collect(),
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  pub(crate) const HEADER: &str = "ModbusManager 1.0.9\n\
    Date: 2023-01-12\n\
    Product: F1255\n\
    Database: 9161\n\
    Title;Info;ID;Unit;Size;Factor;Min;Max;Default;Mode\n";

  pub(crate) fn export(body: &str) -> String {
    format!("{HEADER}{body}")
  }

  fn tokens(line: &str) -> Result<Vec<(String, bool)>, TokenizeError> {
    let mut tokenizer = Tokenizer::new(line.as_bytes());
    let mut tokens = Vec::new();
    while let Some(token) = tokenizer.next_token()? {
      tokens.push((decode_text(&token.text), token.quoted));
    }
    Ok(tokens)
  }

  #[test]
  fn tokenizer_handles_quotes() {
    let mut tokenizer = Tokenizer::new(br#""a";"b""c";d"e";"f;g""#);
    let mut next = || {
      tokenizer
        .next_token()
        .map(|token| token.map(|token| decode_text(&token.text)))
    };

    assert_eq!(next(), Ok(Some("a".to_owned())));
    assert_eq!(next(), Ok(Some("b\"c".to_owned())));
    assert_eq!(next(), Ok(Some("d\"e\"".to_owned())));
    assert_eq!(next(), Ok(Some("f;g".to_owned())));
    assert_eq!(next(), Ok(None));
  }

  #[test]
  fn tokenizer_distinguishes_empty_from_end() {
    assert_eq!(tokens(""), Ok(vec![]));
    assert_eq!(
      tokens(";\"\";x"),
      Ok(vec![
        ("".to_owned(), false),
        ("".to_owned(), true),
        ("x".to_owned(), false)
      ])
    );
    assert_eq!(tokens("a;"), Ok(vec![("a".to_owned(), false)]));
  }

  #[test]
  fn tokenizer_rejects_unterminated_quote() {
    assert_eq!(tokens("\"abc;def"), Err(TokenizeError::Unterminated(0)));
    assert_eq!(tokens("x;\"a\"\""), Err(TokenizeError::Unterminated(2)));
    assert_eq!(tokens("\"a\"b;c"), Err(TokenizeError::Trailing(3)));
  }

  #[test]
  fn parses_single_register() {
    let input = export(
      "\"BT1 Outdoor Temperature\";\"Current outdoor temperature\";\
       40004;\"°C\";s16;10;-400;400;0;R\n",
    );
    let mut output = BTreeMap::new();

    let count = parse_catalog(input.as_bytes(), Some(&mut output), |_| true);

    assert_eq!(count, Ok(1));
    assert_eq!(output.len(), 1);
    assert_eq!(
      output.get(&40004),
      Some(&Register {
        id: 40004,
        title: "BT1 Outdoor Temperature".to_owned(),
        info: "Current outdoor temperature".to_owned(),
        unit: Unit::Celsius,
        data_type: DataType::Int16,
        factor: 10,
        min_value: -400,
        max_value: 400,
        default_value: 0,
        mode: Mode::Read,
      })
    );
  }

  #[test]
  fn parses_latin1_export_with_crlf() {
    let mut input = HEADER.replace('\n', "\r\n").into_bytes();
    input.extend_from_slice(
      b"\"Temp\xE9rature\";\"\";40008;\"\xB0C\";s16;10;0;0;0;R/W\r\n\r\n",
    );
    let mut output = BTreeMap::new();

    assert_eq!(parse_catalog(&input, Some(&mut output), |_| true), Ok(1));
    let register = &output[&40008];
    assert_eq!(register.title, "Température");
    assert_eq!(register.unit, Unit::Celsius);
    assert_eq!(register.mode, Mode::ReadWrite);
  }

  #[test]
  fn rejects_mutated_column_header() {
    let input = export("").replace("Factor", "XFactor");

    assert!(matches!(
      parse_catalog(input.as_bytes(), None, |_| true),
      Err(CatalogParseError::Columns(_))
    ));
  }

  #[test]
  fn rejects_bad_signature_and_short_header() {
    let input = export("").replace("ModbusManager", "Modbus");

    assert_eq!(
      parse_catalog(input.as_bytes(), None, |_| true),
      Err(CatalogParseError::Signature)
    );
    assert_eq!(
      parse_catalog(b"ModbusManager 1.0.9\nDate\n", None, |_| true),
      Err(CatalogParseError::MissingHeader)
    );
  }

  #[test]
  fn reports_failing_field_index() {
    let cases = [
      ("\"\";\"\";1;\"\";s16;1;0;0;0;R", 1),
      ("Title;\"\";1;\"\";s16;1;0;0;0;R", 1),
      ("\"T\";info;1;\"\";s16;1;0;0;0;R", 2),
      ("\"T\";\"\";x;\"\";s16;1;0;0;0;R", 3),
      ("\"T\";\"\";70000;\"\";s16;1;0;0;0;R", 3),
      ("\"T\";\"\";1;\"parsec\";s16;1;0;0;0;R", 4),
      ("\"T\";\"\";1;\"\";f32;1;0;0;0;R", 5),
      ("\"T\";\"\";1;\"\";s16;ten;0;0;0;R", 6),
      ("\"T\";\"\";1;\"\";s16;1;0;0;0;X", 10),
      ("\"T\";\"\";1;\"\";s16;1;0;0", 9),
      ("\"T\";\"open", 2),
    ];

    for (line, field) in cases {
      let input = export(&format!("\n{line}\n"));
      assert_eq!(
        parse_catalog(input.as_bytes(), None, |_| true),
        Err(CatalogParseError::Field { line: 7, field }),
        "{line}"
      );
    }
  }

  #[test]
  fn rejects_duplicate_ids() {
    let line = "\"T\";\"\";1;\"\";u8;1;0;0;0;R\n";
    let input = export(&format!("{line}{line}"));

    assert_eq!(
      parse_catalog(input.as_bytes(), None, |_| true),
      Err(CatalogParseError::DuplicateId { line: 7, id: 1 })
    );
  }

  #[test]
  fn filter_limits_output_but_not_validation() {
    let input = export(
      "\"A\";\"\";1;\"\";u8;1;0;0;0;R\n\
       \"B\";\"\";2;\"%\";u16;1;0;100;0;R/W\n",
    );
    let mut output = BTreeMap::new();

    assert_eq!(
      parse_catalog(input.as_bytes(), Some(&mut output), |id| id == 2),
      Ok(2)
    );
    assert_eq!(output.keys().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(parse_catalog(input.as_bytes(), None, |_| false), Ok(2));
  }
}
