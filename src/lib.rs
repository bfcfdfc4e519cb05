// Copyright 2023 Divy Srivastava <dj.srivastava23@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! _tickws_ is a client-side WebSocket-over-TLS engine for ultra-low-latency
//! market data ingestion.
//!
//! Incoming TLS records are decrypted straight into a page-mirrored SPSC
//! ring buffer and frames are parsed zero-copy out of it: the frame callback
//! receives a borrow into ring memory, valid until the current
//! [`update`](WebSocket::update) tick returns. Outgoing frames are masked
//! into a second ring and drained opportunistically. PING and CLOSE are
//! answered automatically before the application sees them.
//!
//! The engine is single-threaded and cooperative: an external event loop
//! (epoll, kqueue, mio) calls `update` whenever the socket is ready, and the
//! engine raises or drops WRITE interest through the [`EventNotifier`]
//! collaborator as the TX ring fills and empties. After the handshakes the
//! socket is non-blocking; `update` never sleeps.
//!
//! # Example
//!
//! ```no_run
//! use tickws::{Frame, Handler, Sink, Status, WebSocket};
//!
//! struct Printer;
//!
//! impl Handler for Printer {
//!   fn on_frame(&mut self, _sink: &mut Sink<'_>, frame: Frame<'_>) {
//!     println!("{:?}: {} bytes", frame.opcode, frame.payload.len());
//!   }
//!
//!   fn on_status(&mut self, status: Status) {
//!     println!("status: {status:?}");
//!   }
//! }
//!
//! fn main() -> Result<(), tickws::WebSocketError> {
//!   let mut ws = WebSocket::connect("wss://stream.example.com:9443/ws")?;
//!   let mut printer = Printer;
//!   while !ws.closed() {
//!     // Normally gated on readiness from your event loop.
//!     ws.update(&mut printer);
//!   }
//!   Ok(())
//! }
//! ```
//!
//! Latency probes: each received message carries three timestamps — the
//! cycle tick at entry to the ingestion routine, the tick right after the
//! first successful decrypt, and the NIC hardware receive timestamp
//! recovered from `SO_TIMESTAMPING` control messages — via
//! [`probes`](WebSocket::probes).

mod clock;
mod close;
mod error;
mod frame;
mod handshake;
mod mask;
mod notify;
mod ring;
mod tls;
mod transport;

use std::io;

use url::Url;

use crate::mask::MaskRng;

pub use crate::clock::{CycleClock, LatencyProbes, StdClock, TscClock};
pub use crate::close::CloseCode;
pub use crate::error::WebSocketError;
pub use crate::frame::{Frame, OpCode};
pub use crate::handshake::accept_key;
#[cfg(feature = "mio")]
pub use crate::notify::MioNotifier;
pub use crate::notify::{EventNotifier, Interest};
pub use crate::ring::{RingBuffer, DEFAULT_RING_CAPACITY};
pub use crate::tls::{TlsMode, TlsTransport};
pub use crate::transport::{
  MaybeTlsTransport, NicTimestamp, TcpTransport, TimestampSource, Transport,
};

/// Upper bound on bytes handed to the transport per TX drain step.
const TX_CHUNK_LEN: usize = 4096;

const DEFAULT_HANDSHAKE_TIMEOUT_NS: u64 = 10_000_000_000;

/// Connection lifecycle notifications, emitted at most once each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  /// Both the TLS and the WebSocket handshake completed.
  Connected,
  /// The connection closed: orderly CLOSE, transport failure or protocol
  /// violation. [`WebSocket::last_error`] distinguishes.
  Closed,
}

/// Application callbacks driven by [`WebSocket::update`].
pub trait Handler {
  /// One received frame. The payload borrow dies when the callback
  /// returns; the read cursor has already advanced past the frame, so
  /// sending through `sink` from here is fine.
  fn on_frame(&mut self, sink: &mut Sink<'_>, frame: Frame<'_>);

  fn on_status(&mut self, status: Status) {
    let _ = status;
  }
}

/// Send access granted to [`Handler::on_frame`]; frames queued here are
/// drained later in the same `update` tick.
pub struct Sink<'a> {
  tx: &'a RingBuffer,
  rng: &'a mut MaskRng,
  pending: &'a mut bool,
}

impl Sink<'_> {
  pub fn send(
    &mut self,
    opcode: OpCode,
    payload: &[u8],
  ) -> Result<(), WebSocketError> {
    enqueue_frame(self.tx, self.rng, opcode, payload)?;
    *self.pending = true;
    Ok(())
  }

  pub fn send_text(&mut self, payload: &[u8]) -> Result<(), WebSocketError> {
    self.send(OpCode::Text, payload)
  }

  pub fn send_binary(&mut self, payload: &[u8]) -> Result<(), WebSocketError> {
    self.send(OpCode::Binary, payload)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
  /// TCP pending or TLS handshake in flight.
  Connecting,
  /// Upgrade request queued, awaiting the 101.
  Handshaking,
  Connected,
  Closed,
}

/// A single WebSocket client connection.
///
/// Generic over the byte [`Transport`] (TLS in production, plain TCP for
/// `ws://` and tests) and the [`CycleClock`] used for latency probes and the
/// handshake deadline.
pub struct WebSocket<T, C = StdClock> {
  transport: T,
  clock: C,
  rx: RingBuffer,
  tx: RingBuffer,
  rng: MaskRng,
  host: String,
  port: u16,
  path: String,
  secure: bool,
  sec_key: String,
  expected_accept: String,
  hs_buf: Vec<u8>,
  state: ConnState,
  probes: LatencyProbes,
  notifier: Option<Box<dyn EventNotifier>>,
  has_pending_tx: bool,
  write_interest: bool,
  handshake_started: Option<u64>,
  handshake_timeout_ns: u64,
  last_error: Option<WebSocketError>,
  scratch: Vec<u8>,
}

impl WebSocket<MaybeTlsTransport> {
  /// Connects to a `ws://` or `wss://` URL: resolves, opens and tunes the
  /// socket (5-second bound). TLS and WebSocket handshakes are then driven
  /// by [`update`](Self::update) ticks.
  pub fn connect(url: &str) -> Result<Self, WebSocketError> {
    let (host, port, _, secure) = parse_url(url)?;
    let transport = if secure {
      MaybeTlsTransport::Tls(TlsTransport::create(&host, port)?)
    } else {
      MaybeTlsTransport::Plain(TcpTransport::create(&host, port)?)
    };
    Self::over(transport, url)
  }
}

impl<T: Transport> WebSocket<T> {
  /// Builds a connection over an already-connected transport.
  pub fn over(transport: T, url: &str) -> Result<Self, WebSocketError> {
    Self::with_clock(transport, url, StdClock::default())
  }
}

impl<T: Transport, C: CycleClock> WebSocket<T, C> {
  pub fn with_clock(
    transport: T,
    url: &str,
    clock: C,
  ) -> Result<Self, WebSocketError> {
    Self::with_ring_capacity(transport, url, clock, DEFAULT_RING_CAPACITY)
  }

  /// Like [`with_clock`](Self::with_clock) with explicit ring capacity
  /// (power of two; one RX and one TX ring of this size are allocated).
  pub fn with_ring_capacity(
    transport: T,
    url: &str,
    clock: C,
    capacity: usize,
  ) -> Result<Self, WebSocketError> {
    let (host, port, path, secure) = parse_url(url)?;
    let sec_key = handshake::generate_key();
    let expected_accept = handshake::accept_key(&sec_key);

    Ok(WebSocket {
      transport,
      clock,
      rx: RingBuffer::with_capacity(capacity)?,
      tx: RingBuffer::with_capacity(capacity)?,
      rng: MaskRng::from_entropy(),
      host,
      port,
      path,
      secure,
      sec_key,
      expected_accept,
      hs_buf: Vec::with_capacity(handshake::RESPONSE_BUFFER_LEN),
      state: ConnState::Connecting,
      probes: LatencyProbes::default(),
      notifier: None,
      has_pending_tx: false,
      write_interest: false,
      handshake_started: None,
      handshake_timeout_ns: DEFAULT_HANDSHAKE_TIMEOUT_NS,
      last_error: None,
      scratch: Vec::new(),
    })
  }

  #[inline]
  pub fn connected(&self) -> bool {
    self.state == ConnState::Connected
  }

  #[inline]
  pub fn closed(&self) -> bool {
    self.state == ConnState::Closed
  }

  #[inline]
  pub fn has_pending_tx(&self) -> bool {
    self.has_pending_tx
  }

  /// Timestamps captured for the most recent received message.
  #[inline]
  pub fn probes(&self) -> LatencyProbes {
    self.probes
  }

  /// What closed the connection, if anything has.
  pub fn last_error(&self) -> Option<&WebSocketError> {
    self.last_error.as_ref()
  }

  pub fn transport(&self) -> &T {
    &self.transport
  }

  /// Registers the event-notifier back-reference used to raise and drop
  /// WRITE interest for this connection's descriptor.
  pub fn set_notifier(&mut self, notifier: Box<dyn EventNotifier>) {
    self.notifier = Some(notifier);
  }

  /// Deadline for the upgrade response, measured against the cycle clock.
  pub fn set_handshake_timeout_ns(&mut self, ns: u64) {
    self.handshake_timeout_ns = ns;
  }

  /// The non-blocking drive step. Call whenever the event notifier reports
  /// the descriptor ready (and once right after construction).
  pub fn update<H: Handler>(&mut self, handler: &mut H) {
    match self.state {
      ConnState::Closed => {}
      ConnState::Connecting => self.drive_connecting(handler),
      ConnState::Handshaking => self.drive_handshaking(handler),
      ConnState::Connected => self.drive_connected(handler),
    }
    self.sync_write_interest();
  }

  /// Queues a masked frame. Fails with `TxRingFull` when the TX ring
  /// cannot hold it whole; nothing partial is ever committed.
  pub fn send(
    &mut self,
    opcode: OpCode,
    payload: &[u8],
  ) -> Result<(), WebSocketError> {
    if self.state == ConnState::Closed {
      return Err(WebSocketError::ConnectionClosed);
    }
    enqueue_frame(&self.tx, &mut self.rng, opcode, payload)?;
    self.has_pending_tx = true;
    self.sync_write_interest();
    Ok(())
  }

  pub fn send_text(&mut self, payload: &[u8]) -> Result<(), WebSocketError> {
    self.send(OpCode::Text, payload)
  }

  pub fn send_binary(&mut self, payload: &[u8]) -> Result<(), WebSocketError> {
    self.send(OpCode::Binary, payload)
  }

  /// Client-initiated close: queues CLOSE with `code`, makes one
  /// best-effort drain and transitions to closed. The socket itself is
  /// released on drop, which lets a queued CLOSE that already reached the
  /// kernel go out.
  pub fn close(&mut self, code: CloseCode) {
    if self.state == ConnState::Closed {
      return;
    }
    let status = u16::from(code).to_be_bytes();
    if enqueue_frame(&self.tx, &mut self.rng, OpCode::Close, &status).is_err() {
      let _ = self.drain_tx();
      let _ = enqueue_frame(&self.tx, &mut self.rng, OpCode::Close, &status);
    }
    self.has_pending_tx = self.tx.available_read() > 0;
    let _ = self.drain_tx();
    self.state = ConnState::Closed;
    self.sync_write_interest();
  }

  fn drive_connecting<H: Handler>(&mut self, handler: &mut H) {
    match self.transport.drive_handshake() {
      Ok(true) => {
        let request = handshake::build_request(
          &self.host,
          self.port,
          &self.path,
          self.secure,
          &self.sec_key,
        );
        if !self.tx.stage(0, request.as_bytes()) {
          self.fail(WebSocketError::TxRingFull, handler);
          return;
        }
        self.tx.commit_write(request.len());
        self.has_pending_tx = true;
        self.state = ConnState::Handshaking;
        self.handshake_started = Some(self.clock.now_ticks());
        if let Err(e) = self.drain_tx() {
          self.fail(e, handler);
        }
      }
      Ok(false) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
      Err(e) => {
        self.fail(WebSocketError::TlsHandshake(e.to_string()), handler);
      }
    }
  }

  fn drive_handshaking<H: Handler>(&mut self, handler: &mut H) {
    if let Some(started) = self.handshake_started {
      let elapsed = self.clock.now_ticks().wrapping_sub(started);
      if self.clock.ticks_to_ns(elapsed) > self.handshake_timeout_ns as f64 {
        self.fail(WebSocketError::HandshakeTimeout, handler);
        return;
      }
    }

    if self.has_pending_tx {
      if let Err(e) = self.drain_tx() {
        self.fail(e, handler);
        return;
      }
    }

    loop {
      let space = handshake::RESPONSE_BUFFER_LEN - self.hs_buf.len();
      if space == 0 {
        self.fail(WebSocketError::HandshakeBufferOverflow, handler);
        return;
      }

      let mut chunk = [0u8; 1024];
      let want = space.min(chunk.len());
      match self.transport.read_into(&mut chunk[..want]) {
        Ok(0) => {
          self.fail(WebSocketError::ConnectionClosed, handler);
          return;
        }
        Ok(n) => {
          self.hs_buf.extend_from_slice(&chunk[..n]);
          match handshake::parse_response(&self.hs_buf, &self.expected_accept)
          {
            Ok(Some(header_len)) => {
              // Frames piggybacked on the same segment belong to the ring.
              let leftover = &self.hs_buf[header_len..];
              if !leftover.is_empty() {
                if !self.rx.stage(0, leftover) {
                  self.fail(WebSocketError::HandshakeBufferOverflow, handler);
                  return;
                }
                self.rx.commit_write(leftover.len());
              }
              self.hs_buf.clear();
              self.state = ConnState::Connected;
              log::debug!(
                "upgrade complete: {}:{}{}",
                self.host,
                self.port,
                self.path
              );
              handler.on_status(Status::Connected);
              self.parse_frames(handler);
              if self.state != ConnState::Closed && self.has_pending_tx {
                if let Err(e) = self.drain_tx() {
                  self.fail(e, handler);
                }
              }
              return;
            }
            Ok(None) => {}
            Err(e) => {
              if std::env::var("WS_DEBUG").map(|v| v == "1").unwrap_or(false)
              {
                log::warn!(
                  "upgrade failed: {e}; response head: {:?}",
                  String::from_utf8_lossy(
                    &self.hs_buf[..self.hs_buf.len().min(256)]
                  )
                );
              }
              self.fail(e, handler);
              return;
            }
          }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) => {
          self.fail(WebSocketError::Io(e), handler);
          return;
        }
      }
    }
  }

  fn drive_connected<H: Handler>(&mut self, handler: &mut H) {
    self.ingest(handler);
    if self.state == ConnState::Closed {
      return;
    }
    self.parse_frames(handler);
    if self.state == ConnState::Closed {
      return;
    }
    if self.has_pending_tx {
      if let Err(e) = self.drain_tx() {
        self.fail(e, handler);
      }
    }
  }

  /// Pulls decrypted bytes into the RX ring until the transport would
  /// block, its decrypt buffer is empty, or the ring is full.
  fn ingest<H: Handler>(&mut self, handler: &mut H) {
    self.probes.event_tick = self.clock.now_ticks();
    let mut first = true;

    loop {
      let (ptr, len) = self.rx.write_region();
      if len == 0 {
        break;
      }
      // SAFETY: producer-side region of the RX ring; bytes become visible
      // to the parser only after commit_write below.
      let buf = unsafe { std::slice::from_raw_parts_mut(ptr, len) };

      match self.transport.read_into(buf) {
        Ok(0) => {
          self.shutdown(handler);
          return;
        }
        Ok(n) => {
          if first {
            self.probes.ssl_read_tick = self.clock.now_ticks();
            self.probes.nic = self.transport.nic_timestamp();
            first = false;
          }
          self.rx.commit_write(n);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) => {
          self.fail(WebSocketError::Io(e), handler);
          return;
        }
      }

      if self.transport.pending() == 0 {
        break;
      }
    }
  }

  fn parse_frames<H: Handler>(&mut self, handler: &mut H) {
    while self.state != ConnState::Closed && self.rx.available_read() >= 2 {
      let (ptr, len) = self.rx.read_region();
      // SAFETY: readable region of the RX ring. advance_read only moves
      // the cursor; the bytes stay intact until the next ingest, which
      // cannot run before this parse loop returns.
      let region: &[u8] = unsafe { std::slice::from_raw_parts(ptr, len) };

      match frame::decode(region) {
        Ok(Some(head)) => {
          if head.total_len() > self.rx.capacity() - 1 {
            self.fail(WebSocketError::FrameLengthOverflow, handler);
            return;
          }
          let payload =
            &region[head.header_len..head.header_len + head.payload_len];
          if !self.dispatch(handler, head.opcode, payload, head.total_len()) {
            return;
          }
        }
        Ok(None) => {
          if len < self.rx.available_read() {
            // The frame spans the physical wrap of a non-mirrored backing;
            // assemble it in the bounce buffer to keep parsing live.
            match self.bounce_parse(handler) {
              Ok(true) => continue,
              Ok(false) => {}
              Err(e) => {
                self.fail(e, handler);
                return;
              }
            }
          }
          if self.rx.available_read() == self.rx.capacity() - 1 {
            // Ring full yet still no complete frame: it can never finish.
            self.fail(WebSocketError::FrameLengthOverflow, handler);
          }
          return;
        }
        Err(e) => {
          self.fail(e, handler);
          return;
        }
      }
    }
  }

  /// Cold path: copies the split frame contiguous and delivers from the
  /// copy. Returns whether a frame was consumed.
  fn bounce_parse<H: Handler>(
    &mut self,
    handler: &mut H,
  ) -> Result<bool, WebSocketError> {
    let avail = self.rx.available_read();
    let mut scratch = std::mem::take(&mut self.scratch);
    scratch.resize(avail, 0);
    let n = self.rx.peek_into(&mut scratch);
    scratch.truncate(n);

    let result = match frame::decode(&scratch) {
      Ok(Some(head)) => {
        if head.total_len() > self.rx.capacity() - 1 {
          Err(WebSocketError::FrameLengthOverflow)
        } else {
          let payload =
            &scratch[head.header_len..head.header_len + head.payload_len];
          Ok(self.dispatch(handler, head.opcode, payload, head.total_len()))
        }
      }
      Ok(None) => Ok(false),
      Err(e) => Err(e),
    };

    self.scratch = scratch;
    self.scratch.clear();
    result
  }

  /// Synthesizes any control response, advances the read cursor, then
  /// invokes the frame callback — in that order, so the application
  /// observes the reply already queued and may send re-entrantly. Returns
  /// false once the connection transitioned to closed.
  fn dispatch<H: Handler>(
    &mut self,
    handler: &mut H,
    opcode: OpCode,
    payload: &[u8],
    total: usize,
  ) -> bool {
    match opcode {
      OpCode::Ping => self.queue_pong(payload),
      OpCode::Close => self.queue_close_echo(payload),
      _ => {}
    }

    self.rx.advance_read(total);

    let mut sink = Sink {
      tx: &self.tx,
      rng: &mut self.rng,
      pending: &mut self.has_pending_tx,
    };
    handler.on_frame(&mut sink, Frame { opcode, payload });

    if opcode == OpCode::Close {
      self.shutdown(handler);
      return false;
    }
    true
  }

  /// PONG with the PING's payload. Best effort: one drain attempt before
  /// the PONG is dropped (RFC 6455 permits unsent PONGs).
  fn queue_pong(&mut self, payload: &[u8]) {
    if enqueue_frame(&self.tx, &mut self.rng, OpCode::Pong, payload).is_err() {
      let _ = self.drain_tx();
      if enqueue_frame(&self.tx, &mut self.rng, OpCode::Pong, payload)
        .is_err()
      {
        log::debug!("dropping PONG, TX ring full");
        return;
      }
    }
    self.has_pending_tx = true;
  }

  /// CLOSE echo carrying only the 2-byte status code.
  fn queue_close_echo(&mut self, payload: &[u8]) {
    let code = if payload.len() >= 2 { &payload[..2] } else { &[] };
    if enqueue_frame(&self.tx, &mut self.rng, OpCode::Close, code).is_err() {
      let _ = self.drain_tx();
      if enqueue_frame(&self.tx, &mut self.rng, OpCode::Close, code).is_err()
      {
        log::debug!("dropping CLOSE echo, TX ring full");
        return;
      }
    }
    self.has_pending_tx = true;
  }

  /// Flushes the TX ring through the transport in bounded chunks.
  fn drain_tx(&mut self) -> Result<(), WebSocketError> {
    while self.tx.available_read() > 0 {
      let (ptr, len) = self.tx.read_region();
      let chunk = len.min(TX_CHUNK_LEN);
      // SAFETY: readable region of the TX ring, consumed by this thread.
      let buf = unsafe { std::slice::from_raw_parts(ptr, chunk) };

      match self.transport.send(buf) {
        Ok(0) => break,
        Ok(n) => self.tx.advance_read(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) => return Err(WebSocketError::Io(e)),
      }
    }

    if self.tx.available_read() == 0 {
      self.has_pending_tx = false;
    }
    Ok(())
  }

  /// Orderly transition to closed after a CLOSE exchange or EOF.
  fn shutdown<H: Handler>(&mut self, handler: &mut H) {
    let _ = self.drain_tx();
    self.state = ConnState::Closed;
    handler.on_status(Status::Closed);
  }

  /// Closed-on-first-error: records the cause, flips the state and emits
  /// the status callback exactly once.
  fn fail<H: Handler>(&mut self, error: WebSocketError, handler: &mut H) {
    log::debug!("closing connection: {error}");
    self.last_error = Some(error);
    self.state = ConnState::Closed;
    handler.on_status(Status::Closed);
  }

  fn sync_write_interest(&mut self) {
    let want = self.has_pending_tx && self.state != ConnState::Closed;
    if want == self.write_interest {
      return;
    }
    if let (Some(notifier), Some(fd)) =
      (self.notifier.as_mut(), self.transport.raw_fd())
    {
      let interest = if want { Interest::READ_WRITE } else { Interest::READ };
      if let Err(e) = notifier.modify(fd, interest) {
        log::debug!("notifier modify failed: {e}");
        return;
      }
    }
    self.write_interest = want;
  }
}

/// Reservation-then-commit masked frame write: header and payload are
/// staged beyond the committed offset and published with one commit, so a
/// header is never visible without its payload.
fn enqueue_frame(
  tx: &RingBuffer,
  rng: &mut MaskRng,
  opcode: OpCode,
  payload: &[u8],
) -> Result<(), WebSocketError> {
  let mut header = [0u8; frame::MAX_HEADER_LEN];
  let key = rng.next_key();
  let header_len =
    frame::encode_header(&mut header, opcode, payload.len(), key);

  let total = header_len
    .checked_add(payload.len())
    .ok_or(WebSocketError::FrameLengthOverflow)?;
  if tx.available_write() < total {
    return Err(WebSocketError::TxRingFull);
  }

  tx.stage(0, &header[..header_len]);
  tx.stage_masked(header_len, payload, key);
  tx.commit_write(total);
  Ok(())
}

fn parse_url(url: &str) -> Result<(String, u16, String, bool), WebSocketError> {
  if url.is_empty() {
    return Err(WebSocketError::InvalidUrl);
  }
  let parsed = Url::parse(url).map_err(|_| WebSocketError::InvalidUrl)?;
  let secure = match parsed.scheme() {
    "wss" => true,
    "ws" => false,
    scheme => return Err(WebSocketError::UnsupportedScheme(scheme.into())),
  };
  let host = parsed.host_str().ok_or(WebSocketError::InvalidUrl)?.to_string();
  let port = parsed.port().unwrap_or(if secure { 443 } else { 80 });
  let path = match parsed.path() {
    "" => "/".to_string(),
    path => path.to_string(),
  };
  Ok((host, port, path, secure))
}
