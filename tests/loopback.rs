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

//! End-to-end tests against a scripted RFC 6455 server on a TCP loopback.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tickws::{
  accept_key, Frame, Handler, OpCode, Sink, Status, TcpTransport, WebSocket,
};

/// Surfaces the engine's `log` diagnostics (including the `WS_DEBUG` /
/// `WS_DEBUG_KTLS` paths) when a test runs with `RUST_LOG` set.
fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct Collector {
  frames: Vec<(OpCode, Vec<u8>)>,
  statuses: Vec<Status>,
}

impl Handler for Collector {
  fn on_frame(&mut self, _sink: &mut Sink<'_>, frame: Frame<'_>) {
    self.frames.push((frame.opcode, frame.payload.to_vec()));
  }

  fn on_status(&mut self, status: Status) {
    self.statuses.push(status);
  }
}

/// Blocking server side of one upgrade: consumes the request, answers with
/// a correct 101.
fn serve_upgrade(stream: &mut TcpStream) -> Result<()> {
  let mut buf = Vec::new();
  let mut byte = [0u8; 1];
  while !buf.ends_with(b"\r\n\r\n") {
    stream.read_exact(&mut byte)?;
    buf.push(byte[0]);
    if buf.len() > 8192 {
      bail!("oversized upgrade request");
    }
  }

  let request = String::from_utf8(buf)?;
  let key = request
    .lines()
    .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
    .context("missing Sec-WebSocket-Key")?
    .trim();

  let response = format!(
    "HTTP/1.1 101 Switching Protocols\r\n\
     Upgrade: websocket\r\n\
     Connection: Upgrade\r\n\
     Sec-WebSocket-Accept: {}\r\n\
     \r\n",
    accept_key(key)
  );
  stream.write_all(response.as_bytes())?;
  Ok(())
}

/// Sends an unmasked server frame.
fn server_send(stream: &mut TcpStream, opcode: u8, payload: &[u8]) -> Result<()> {
  let mut frame = vec![0x80 | opcode];
  if payload.len() <= 125 {
    frame.push(payload.len() as u8);
  } else if payload.len() <= 65535 {
    frame.push(126);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
  } else {
    frame.push(127);
    frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
  }
  frame.extend_from_slice(payload);
  stream.write_all(&frame)?;
  Ok(())
}

/// Reads one masked client frame and returns (opcode, unmasked payload).
fn server_recv(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
  let mut head = [0u8; 2];
  stream.read_exact(&mut head)?;
  let opcode = head[0] & 0x0F;
  if head[0] & 0x80 == 0 {
    bail!("client frame without FIN");
  }
  if head[1] & 0x80 == 0 {
    bail!("client frame without MASK");
  }

  let len = match head[1] & 0x7F {
    126 => {
      let mut ext = [0u8; 2];
      stream.read_exact(&mut ext)?;
      u16::from_be_bytes(ext) as usize
    }
    127 => {
      let mut ext = [0u8; 8];
      stream.read_exact(&mut ext)?;
      u64::from_be_bytes(ext) as usize
    }
    n => n as usize,
  };

  let mut key = [0u8; 4];
  stream.read_exact(&mut key)?;
  let mut payload = vec![0u8; len];
  stream.read_exact(&mut payload)?;
  for (i, b) in payload.iter_mut().enumerate() {
    *b ^= key[i & 3];
  }
  Ok((opcode, payload))
}

struct Rig {
  ws: WebSocket<TcpTransport>,
  collector: Collector,
}

impl Rig {
  fn pump(&mut self) {
    self.ws.update(&mut self.collector);
  }

  /// Pumps until `cond` holds or two seconds elapse.
  fn pump_until(&mut self, mut cond: impl FnMut(&Self) -> bool) -> bool {
    for _ in 0..2000 {
      self.pump();
      if cond(self) {
        return true;
      }
      thread::sleep(Duration::from_millis(1));
    }
    false
  }
}

/// Starts the scripted server and a connected client.
fn rig(server: impl FnOnce(TcpStream) + Send + 'static) -> Result<Rig> {
  init_logging();
  let listener = TcpListener::bind("127.0.0.1:0")?;
  let addr = listener.local_addr()?;

  thread::spawn(move || {
    if let Ok((mut stream, _)) = listener.accept() {
      stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
      if serve_upgrade(&mut stream).is_ok() {
        server(stream);
      }
    }
  });

  let stream = TcpStream::connect(addr)?;
  let transport = TcpTransport::from_stream(stream)?;
  let url = format!("ws://{}/echo", addr);
  let ws = WebSocket::over(transport, &url)?;

  let mut rig = Rig { ws, collector: Collector::default() };
  if !rig.pump_until(|r| r.ws.connected() || r.ws.closed()) {
    bail!("handshake did not complete");
  }
  Ok(rig)
}

#[test]
fn receives_server_text_frame() -> Result<()> {
  let mut rig = rig(|mut stream| {
    server_send(&mut stream, 0x1, b"hi").unwrap();
    thread::sleep(Duration::from_millis(200));
  })?;

  assert!(rig.pump_until(|r| !r.collector.frames.is_empty()));
  assert_eq!(rig.collector.frames[0], (OpCode::Text, b"hi".to_vec()));
  assert_eq!(rig.collector.statuses, vec![Status::Connected]);
  Ok(())
}

#[test]
fn boundary_payload_sizes_round_trip() -> Result<()> {
  const SIZES: [usize; 7] = [0, 1, 125, 126, 127, 65535, 65536];

  let mut rig = rig(|mut stream| {
    // Echo every client frame back unmasked.
    for _ in 0..SIZES.len() {
      let (opcode, payload) = server_recv(&mut stream).unwrap();
      server_send(&mut stream, opcode, &payload).unwrap();
    }
    thread::sleep(Duration::from_millis(200));
  })?;

  for size in SIZES {
    let payload = (0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>();
    rig.ws.send_binary(&payload)?;

    let want = rig.collector.frames.len() + 1;
    assert!(
      rig.pump_until(|r| r.collector.frames.len() >= want),
      "no echo for size {size}"
    );
    let (opcode, got) = rig.collector.frames.last().unwrap().clone();
    assert_eq!(opcode, OpCode::Binary, "opcode for size {size}");
    assert_eq!(got, payload, "payload for size {size}");
  }
  Ok(())
}

#[test]
fn ping_is_answered_with_pong() -> Result<()> {
  let (done_tx, done_rx) = std::sync::mpsc::channel();

  let mut rig = rig(move |mut stream| {
    server_send(&mut stream, 0x9, b"abc").unwrap();
    let result = server_recv(&mut stream);
    done_tx.send(result).ok();
    thread::sleep(Duration::from_millis(200));
  })?;

  assert!(rig.pump_until(|r| !r.collector.frames.is_empty()));
  assert_eq!(rig.collector.frames[0], (OpCode::Ping, b"abc".to_vec()));

  let (opcode, payload) = done_rx.recv_timeout(Duration::from_secs(5))??;
  assert_eq!(opcode, 0xA);
  assert_eq!(payload, b"abc");
  Ok(())
}

#[test]
fn server_close_is_echoed_and_fatal() -> Result<()> {
  let (done_tx, done_rx) = std::sync::mpsc::channel();

  let mut rig = rig(move |mut stream| {
    server_send(&mut stream, 0x8, &[0x03, 0xE8]).unwrap();
    let result = server_recv(&mut stream);
    done_tx.send(result).ok();
    thread::sleep(Duration::from_millis(200));
  })?;

  assert!(rig.pump_until(|r| r.ws.closed()));
  assert_eq!(
    rig.collector.statuses,
    vec![Status::Connected, Status::Closed]
  );
  assert!(rig.ws.last_error().is_none());

  let (opcode, payload) = done_rx.recv_timeout(Duration::from_secs(5))??;
  assert_eq!(opcode, 0x8);
  assert_eq!(payload, vec![0x03, 0xE8]);

  assert!(rig.ws.send_text(b"late").is_err());
  Ok(())
}

#[test]
fn masked_server_frame_closes_without_delivery() -> Result<()> {
  let mut rig = rig(|mut stream| {
    stream.write_all(&[0x81, 0x82, 0, 0, 0, 0, 0x61, 0x61]).unwrap();
    thread::sleep(Duration::from_millis(200));
  })?;

  assert!(rig.pump_until(|r| r.ws.closed()));
  assert!(rig.collector.frames.is_empty());
  assert!(matches!(
    rig.ws.last_error(),
    Some(tickws::WebSocketError::ServerMaskedFrame)
  ));
  Ok(())
}

#[test]
fn rejected_upgrade_status_closes() -> Result<()> {
  init_logging();
  let listener = TcpListener::bind("127.0.0.1:0")?;
  let addr = listener.local_addr()?;

  thread::spawn(move || {
    if let Ok((mut stream, _)) = listener.accept() {
      stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
      let mut scratch = [0u8; 4096];
      let _ = stream.read(&mut scratch);
      let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
      thread::sleep(Duration::from_millis(200));
    }
  });

  let stream = TcpStream::connect(addr)?;
  let transport = TcpTransport::from_stream(stream)?;
  let url = format!("ws://{}/echo", addr);
  let mut ws = WebSocket::over(transport, &url)?;
  let mut collector = Collector::default();

  for _ in 0..2000 {
    ws.update(&mut collector);
    if ws.closed() {
      break;
    }
    thread::sleep(Duration::from_millis(1));
  }

  assert!(ws.closed());
  assert!(!ws.connected());
  assert!(matches!(
    ws.last_error(),
    Some(tickws::WebSocketError::UpgradeRejected(200))
  ));
  assert_eq!(collector.statuses, vec![Status::Closed]);
  Ok(())
}

#[test]
fn client_close_reaches_server() -> Result<()> {
  let (done_tx, done_rx) = std::sync::mpsc::channel();

  let mut rig = rig(move |mut stream| {
    let result = server_recv(&mut stream);
    done_tx.send(result).ok();
    thread::sleep(Duration::from_millis(200));
  })?;

  rig.ws.close(tickws::CloseCode::Normal);
  assert!(rig.ws.closed());

  let (opcode, payload) = done_rx.recv_timeout(Duration::from_secs(5))??;
  assert_eq!(opcode, 0x8);
  assert_eq!(payload, vec![0x03, 0xE8]);
  Ok(())
}
