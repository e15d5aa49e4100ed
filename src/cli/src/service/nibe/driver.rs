use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::metrics::{self, Metrics};
use super::protocol::*;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
  #[error("Serial line failure")]
  Io(#[from] std::io::Error),
}

/// Half-duplex byte link to the heat pump.
pub(crate) trait Transport {
  fn bytes_available(&mut self) -> Result<bool, TransportError>;

  /// Blocks until a byte arrives; `None` when the read timeout elapsed.
  fn read_byte(&mut self) -> Result<Option<u8>, TransportError>;

  fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

  fn flush(&mut self) -> Result<(), TransportError>;

  /// Asserts the line driver before a write.
  fn begin_transmit(&mut self) -> Result<(), TransportError>;

  /// Releases the line driver once the flushed bytes left the wire.
  fn end_transmit(&mut self) -> Result<(), TransportError>;
}

/// Receives frames and token offers from the driver. Runs on the driver
/// thread, so implementations must not block.
pub(crate) trait Callback {
  fn on_message_received(&self, frame: &[u8]);

  /// Fills `out` with a request and returns its length, or 0 when there
  /// is nothing to send.
  fn on_read_token_received(&self, out: &mut [u8]) -> usize;

  fn on_write_token_received(&self, out: &mut [u8]) -> usize;
}

impl<T: Callback + ?Sized> Callback for Arc<T> {
  fn on_message_received(&self, frame: &[u8]) {
    (**self).on_message_received(frame)
  }

  fn on_read_token_received(&self, out: &mut [u8]) -> usize {
    (**self).on_read_token_received(out)
  }

  fn on_write_token_received(&self, out: &mut [u8]) -> usize {
    (**self).on_write_token_received(out)
  }
}

/// Which accessory addresses this gateway answers for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AckPolicy {
  pub(crate) modbus40: bool,
  pub(crate) rmu40: bool,
  pub(crate) sms40: bool,
}

impl AckPolicy {
  pub(crate) fn should_ack(&self, address: u16) -> bool {
    match Device::from_address(address) {
      Some(Device::Modbus40) => self.modbus40,
      Some(Device::Rmu40) => self.rmu40,
      Some(Device::Sms40) => self.sms40,
      None => false,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
  WaitStart,
  WaitData,
  MessageReceived,
  ChecksumFailure,
}

/// What a completed frame turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
  Message(usize),
  ReadToken(usize),
  WriteToken(usize),
  ChecksumFailure,
  Overflow,
}

pub(crate) struct Driver<TTransport: Transport, TCallback: Callback> {
  transport: TTransport,
  callback: TCallback,
  ack: AckPolicy,
  state: State,
  buffer: Vec<u8>,
  out: [u8; MAX_FRAME_SIZE],
  metrics: Option<Arc<Metrics>>,
}

impl<TTransport: Transport, TCallback: Callback> Driver<TTransport, TCallback> {
  pub(crate) fn new(
    transport: TTransport,
    callback: TCallback,
    ack: AckPolicy,
  ) -> Self {
    Self {
      transport,
      callback,
      ack,
      state: State::WaitStart,
      buffer: Vec::with_capacity(MAX_FRAME_SIZE),
      out: [0u8; MAX_FRAME_SIZE],
      metrics: None,
    }
  }

  pub(crate) fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
    self.metrics = Some(metrics);
    self
  }

  #[cfg(test)]
  pub(crate) fn state(&self) -> State {
    self.state
  }

  #[cfg(test)]
  pub(crate) fn transport(&self) -> &TTransport {
    &self.transport
  }

  /// Reads and handles bytes until cancelled or the transport fails.
  pub(crate) fn run(
    &mut self,
    cancellation: &CancellationToken,
  ) -> Result<(), TransportError> {
    while !cancellation.is_cancelled() {
      if let Some(byte) = self.transport.read_byte()? {
        self.handle_byte(byte)?;
        self.service()?;
      }
    }

    Ok(())
  }

  /// Handles every byte that is already buffered without blocking.
  pub(crate) fn service(&mut self) -> Result<Vec<Event>, TransportError> {
    let mut events = Vec::new();
    while self.transport.bytes_available()? {
      let Some(byte) = self.transport.read_byte()? else {
        break;
      };
      if let Some(event) = self.handle_byte(byte)? {
        events.push(event);
      }
    }

    Ok(events)
  }

  pub(crate) fn handle_byte(
    &mut self,
    byte: u8,
  ) -> Result<Option<Event>, TransportError> {
    match self.state {
      State::WaitStart => {
        if byte == RESPONSE_START {
          self.buffer.clear();
          self.buffer.push(byte);
          self.state = State::WaitData;
        }
        Ok(None)
      }
      State::WaitData => {
        self.buffer.push(byte);
        if self.buffer.len() > MAX_FRAME_SIZE {
          tracing::debug!(
            "Dropping oversized frame {}",
            format_bytes_as_hex(&self.buffer)
          );
          self.count(metrics::OVERSIZED_FRAMES);
          self.state = State::WaitStart;
          return Ok(Some(Event::Overflow));
        }

        let total = match Response::expected_len(&self.buffer) {
          Some(total) if self.buffer.len() >= total => total,
          _ => return Ok(None),
        };

        let computed = checksum(&self.buffer[1..total - 1]);
        let received = self.buffer[total - 1];
        let event = if checksum_matches(computed, received) {
          self.state = State::MessageReceived;
          self.message_received()?
        } else {
          tracing::debug!(
            "Checksum {:#04X} does not match {:#04X} for {}",
            received,
            computed,
            format_bytes_as_hex(&self.buffer)
          );
          self.state = State::ChecksumFailure;
          self.checksum_failure()?
        };
        self.state = State::WaitStart;

        Ok(Some(event))
      }
      State::MessageReceived | State::ChecksumFailure => {
        self.state = State::WaitStart;
        self.handle_byte(byte)
      }
    }
  }

  fn address(&self) -> u16 {
    u16::from_be_bytes([self.buffer[1], self.buffer[2]])
  }

  fn checksum_failure(&mut self) -> Result<Event, TransportError> {
    self.count(metrics::CHECKSUM_FAILURES);
    if self.ack.should_ack(self.address()) {
      Self::transmit(&mut self.transport, &[NAK])?;
    }

    Ok(Event::ChecksumFailure)
  }

  fn message_received(&mut self) -> Result<Event, TransportError> {
    tracing::trace!("Received {}", format_bytes_as_hex(&self.buffer));
    let should_ack = self.ack.should_ack(self.address());

    match token_command(&self.buffer) {
      Some(command) => {
        let (len, metric) = if command == Command::WriteToken {
          let len = self.callback.on_write_token_received(&mut self.out);
          (len, metrics::WRITE_TOKENS)
        } else {
          let len = self.callback.on_read_token_received(&mut self.out);
          (len, metrics::READ_TOKENS)
        };
        self.count(metric);

        let len = len.min(self.out.len());
        if len > 0 {
          tracing::trace!("Sending {}", format_bytes_as_hex(&self.out[..len]));
          Self::transmit(&mut self.transport, &self.out[..len])?;
        } else if should_ack {
          Self::transmit(&mut self.transport, &[ACK])?;
        }

        Ok(match command {
          Command::WriteToken => Event::WriteToken(len),
          _ => Event::ReadToken(len),
        })
      }
      None => {
        self.count(metrics::FRAMES_RECEIVED);
        if should_ack {
          Self::transmit(&mut self.transport, &[ACK])?;
        }
        self.callback.on_message_received(&self.buffer);

        Ok(Event::Message(self.buffer.len()))
      }
    }
  }

  fn transmit(
    transport: &mut TTransport,
    bytes: &[u8],
  ) -> Result<(), TransportError> {
    transport.begin_transmit()?;
    let written = transport
      .write_bytes(bytes)
      .and_then(|_| transport.flush());
    let released = transport.end_transmit();

    written.and(released)
  }

  fn count(&self, name: &str) {
    if let Some(metrics) = &self.metrics {
      metrics.increment(name);
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::collections::VecDeque;

  use parking_lot::Mutex;
  use pretty_assertions::assert_eq;

  use super::*;

  #[derive(Debug, Default)]
  pub(crate) struct MockTransport {
    pub(crate) input: VecDeque<u8>,
    pub(crate) sent: Vec<Vec<u8>>,
    transmitting: bool,
  }

  impl MockTransport {
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
      self.input.extend(bytes);
    }
  }

  impl Transport for MockTransport {
    fn bytes_available(&mut self) -> Result<bool, TransportError> {
      Ok(!self.input.is_empty())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
      Ok(self.input.pop_front())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
      assert!(self.transmitting, "line driver must be enabled");
      if let Some(last) = self.sent.last_mut() {
        last.extend_from_slice(bytes);
      }
      Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
      Ok(())
    }

    fn begin_transmit(&mut self) -> Result<(), TransportError> {
      self.transmitting = true;
      self.sent.push(Vec::new());
      Ok(())
    }

    fn end_transmit(&mut self) -> Result<(), TransportError> {
      self.transmitting = false;
      Ok(())
    }
  }

  #[derive(Debug, Default)]
  struct RecordingCallback {
    messages: Mutex<Vec<Vec<u8>>>,
    reply: Mutex<Vec<u8>>,
    write_tokens: Mutex<usize>,
  }

  impl Callback for RecordingCallback {
    fn on_message_received(&self, frame: &[u8]) {
      self.messages.lock().push(frame.to_vec());
    }

    fn on_read_token_received(&self, out: &mut [u8]) -> usize {
      let reply = self.reply.lock();
      out[..reply.len()].copy_from_slice(&reply);
      reply.len()
    }

    fn on_write_token_received(&self, _out: &mut [u8]) -> usize {
      *self.write_tokens.lock() += 1;
      0
    }
  }

  const MODBUS40_ONLY: AckPolicy = AckPolicy {
    modbus40: true,
    rmu40: false,
    sms40: false,
  };

  fn driver(
    ack: AckPolicy,
  ) -> Driver<MockTransport, Arc<RecordingCallback>> {
    Driver::new(
      MockTransport::default(),
      Arc::new(RecordingCallback::default()),
      ack,
    )
  }

  fn feed(
    driver: &mut Driver<MockTransport, Arc<RecordingCallback>>,
    bytes: &[u8],
  ) -> Vec<Event> {
    driver.transport.feed(bytes);
    driver.service().unwrap_or_default()
  }

  pub(crate) fn read_response(register: u16, value: [u8; 4]) -> Vec<u8> {
    let [low, high] = register.to_le_bytes();
    let mut frame =
      vec![0x5C, 0x00, 0x20, 0x6A, 0x06, low, high, value[0], value[1]];
    frame.extend_from_slice(&value[2..]);
    frame.push(checksum(&frame[1..]));
    frame
  }

  #[test]
  fn read_response_is_dispatched_once() {
    let mut driver = driver(MODBUS40_ONLY);
    let frame = read_response(40004, [0xC8, 0x00, 0x00, 0x00]);

    let events = feed(&mut driver, &frame);

    assert_eq!(events, vec![Event::Message(frame.len())]);
    assert_eq!(driver.state(), State::WaitStart);
    assert_eq!(*driver.callback.messages.lock(), vec![frame]);
    assert_eq!(driver.transport().sent, vec![vec![ACK]]);
  }

  #[test]
  fn wrong_checksum_is_nacked() {
    let mut driver = driver(MODBUS40_ONLY);
    let mut frame = read_response(40004, [0xC8, 0x00, 0x00, 0x00]);
    let last = frame.len() - 1;
    frame[last] ^= 0x01;

    let events = feed(&mut driver, &frame);

    assert_eq!(events, vec![Event::ChecksumFailure]);
    assert_eq!(driver.state(), State::WaitStart);
    assert!(driver.callback.messages.lock().is_empty());
    assert_eq!(driver.transport().sent, vec![vec![NAK]]);
  }

  #[test]
  fn wrong_checksum_is_silent_without_ack() {
    let mut rmu = vec![0x5C, 0x00, 0x19, 0x62, 0x01, 0x7F];
    rmu.push(checksum(&rmu[1..]) ^ 0x01);

    let mut silent = driver(MODBUS40_ONLY);
    assert_eq!(feed(&mut silent, &rmu), vec![Event::ChecksumFailure]);
    assert_eq!(silent.state(), State::WaitStart);
    assert!(silent.callback.messages.lock().is_empty());
    assert!(silent.transport().sent.is_empty());

    let mut chatty = driver(AckPolicy {
      rmu40: true,
      ..MODBUS40_ONLY
    });
    assert_eq!(feed(&mut chatty, &rmu), vec![Event::ChecksumFailure]);
    assert_eq!(chatty.transport().sent, vec![vec![NAK]]);
  }

  #[test]
  fn checksum_alias_is_tolerated() {
    // NOTE: 00 ^ 20 ^ 6A ^ 06 ^ 10 == 5C
    let frame = [0x5C, 0x00, 0x20, 0x6A, 0x06, 0x10, 0, 0, 0, 0, 0];
    assert_eq!(checksum(&frame[1..]), RESPONSE_START);

    for (received, accepted) in
      [(CHECKSUM_ALIAS, true), (RESPONSE_START, true), (0x5D, false)]
    {
      let mut driver = driver(MODBUS40_ONLY);
      let mut bytes = frame.to_vec();
      bytes.push(received);

      let events = feed(&mut driver, &bytes);

      let expected = if accepted {
        Event::Message(bytes.len())
      } else {
        Event::ChecksumFailure
      };
      assert_eq!(events, vec![expected], "{received:#04X}");
    }
  }

  #[test]
  fn noise_before_start_is_discarded() {
    let mut driver = driver(MODBUS40_ONLY);
    let frame = read_response(1, [1, 0, 0, 0]);
    let mut bytes = vec![0x00, 0xC0, 0x06, 0x15];
    bytes.extend_from_slice(&frame);

    let events = feed(&mut driver, &bytes);

    assert_eq!(events, vec![Event::Message(frame.len())]);
    assert_eq!(*driver.callback.messages.lock(), vec![frame]);
  }

  #[test]
  fn read_token_sends_reply_instead_of_ack() {
    let mut driver = driver(MODBUS40_ONLY);
    let request = ReadRequest::new(40004).to_bytes().to_vec();
    *driver.callback.reply.lock() = request.clone();

    let events = feed(&mut driver, &[0x5C, 0x00, 0x20, 0x69, 0x00, 0x49]);

    assert_eq!(events, vec![Event::ReadToken(request.len())]);
    assert_eq!(driver.transport().sent, vec![request]);
    assert!(driver.callback.messages.lock().is_empty());
  }

  #[test]
  fn empty_read_token_is_acked() {
    let mut driver = driver(MODBUS40_ONLY);

    let events = feed(&mut driver, &[0x5C, 0x00, 0x20, 0x69, 0x00, 0x49]);

    assert_eq!(events, vec![Event::ReadToken(0)]);
    assert_eq!(driver.transport().sent, vec![vec![ACK]]);
  }

  #[test]
  fn write_token_is_a_no_op() {
    let mut driver = driver(MODBUS40_ONLY);

    let events = feed(&mut driver, &[0x5C, 0x00, 0x20, 0x6B, 0x00, 0x4B]);

    assert_eq!(events, vec![Event::WriteToken(0)]);
    assert_eq!(*driver.callback.write_tokens.lock(), 1);
    assert_eq!(driver.transport().sent, vec![vec![ACK]]);
  }

  #[test]
  fn ack_policy_is_per_address() {
    let mut rmu = vec![0x5C, 0x00, 0x19, 0x62, 0x01, 0x7F];
    rmu.push(checksum(&rmu[1..]));

    let mut silent = driver(MODBUS40_ONLY);
    assert_eq!(feed(&mut silent, &rmu), vec![Event::Message(rmu.len())]);
    assert!(silent.transport().sent.is_empty());

    let mut chatty = driver(AckPolicy {
      rmu40: true,
      ..MODBUS40_ONLY
    });
    assert_eq!(feed(&mut chatty, &rmu), vec![Event::Message(rmu.len())]);
    assert_eq!(chatty.transport().sent, vec![vec![ACK]]);

    let mut muted = driver(AckPolicy::default());
    let frame = read_response(1, [0; 4]);
    feed(&mut muted, &frame);
    assert!(muted.transport().sent.is_empty());
  }

  #[test]
  fn oversized_frame_resets() {
    let mut driver = driver(MODBUS40_ONLY);
    let mut bytes = vec![0x5C, 0x00, 0x20, 0x68, 0xF0];
    bytes.extend(std::iter::repeat(0x01).take(MAX_FRAME_SIZE));

    let events = feed(&mut driver, &bytes);

    assert_eq!(events, vec![Event::Overflow]);
    assert_eq!(driver.state(), State::WaitStart);
    assert!(driver.callback.messages.lock().is_empty());
    assert!(driver.transport().sent.is_empty());
  }

  #[test]
  fn frames_split_across_reads_are_reassembled() {
    let mut driver = driver(MODBUS40_ONLY);
    let frame = read_response(43005, [0x9C, 0xFF, 0xFF, 0xFF]);
    let (head, tail) = frame.split_at(7);

    assert!(feed(&mut driver, head).is_empty());
    assert_eq!(driver.state(), State::WaitData);
    assert_eq!(feed(&mut driver, tail), vec![Event::Message(frame.len())]);
  }

  #[test]
  fn counters_are_exported() {
    let metrics = Arc::new(Metrics::new());
    let mut driver = driver(MODBUS40_ONLY).with_metrics(metrics.clone());
    let mut broken = read_response(1, [0; 4]);
    let last = broken.len() - 1;
    broken[last] ^= 0xFF;

    feed(&mut driver, &read_response(1, [0; 4]));
    feed(&mut driver, &broken);
    feed(&mut driver, &[0x5C, 0x00, 0x20, 0x69, 0x00, 0x49]);

    assert_eq!(metrics.get(metrics::FRAMES_RECEIVED), Some(1));
    assert_eq!(metrics.get(metrics::CHECKSUM_FAILURES), Some(1));
    assert_eq!(metrics.get(metrics::READ_TOKENS), Some(1));
  }
}
