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

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::WebSocketError;
use crate::tls::TlsTransport;

/// Kernel socket buffer size requested on both directions.
pub(crate) const SOCKET_BUFFER_LEN: usize = 256 * 1024;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a NIC receive timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
  Hardware,
  Software,
}

/// A receive timestamp recovered from a socket control message,
/// nanoseconds since the Unix epoch (hardware clocks may differ until
/// disciplined).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicTimestamp {
  pub ns: u64,
  pub source: TimestampSource,
}

/// The byte transport underneath the framing engine.
///
/// `read_into` and `send` follow `std::io` conventions: `Ok(0)` from
/// `read_into` is an orderly close, `ErrorKind::WouldBlock` means retry on
/// the next `update` tick.
pub trait Transport {
  /// Advances any transport-level handshake. `Ok(true)` once established,
  /// `Ok(false)` while more network round trips are needed.
  fn drive_handshake(&mut self) -> io::Result<bool>;

  /// Reads decrypted bytes directly into `buf`.
  fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;

  fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

  /// Bytes already decrypted and buffered inside the transport; a non-zero
  /// value means another `read_into` will produce data without a syscall.
  fn pending(&self) -> usize;

  /// The most recent timestamp captured by the read path.
  fn nic_timestamp(&self) -> Option<NicTimestamp>;

  fn raw_fd(&self) -> Option<RawFd>;
}

/// Resolves `host` (IPv4 only) and opens a tuned, connected TCP socket.
/// The socket is left in blocking mode.
pub(crate) fn connect_socket(
  host: &str,
  port: u16,
) -> Result<Socket, WebSocketError> {
  let addr = (host, port)
    .to_socket_addrs()?
    .find(|a| a.is_ipv4())
    .ok_or(WebSocketError::DnsFailure)?;

  let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
  socket.set_nodelay(true)?;
  socket.set_keepalive(true)?;
  socket.set_recv_buffer_size(SOCKET_BUFFER_LEN)?;
  socket.set_send_buffer_size(SOCKET_BUFFER_LEN)?;
  #[cfg(target_vendor = "apple")]
  socket.set_nosigpipe(true)?;

  match socket.connect_timeout(&addr.into(), CONNECT_TIMEOUT) {
    Ok(()) => {}
    Err(e)
      if e.kind() == io::ErrorKind::TimedOut
        || e.kind() == io::ErrorKind::WouldBlock =>
    {
      return Err(WebSocketError::ConnectTimeout);
    }
    Err(e) => return Err(e.into()),
  }

  Ok(socket)
}

/// Plain TCP transport for `ws://` endpoints and loopback test rigs. No
/// transport handshake, no decrypt buffer, no NIC timestamps.
pub struct TcpTransport {
  stream: TcpStream,
}

impl TcpTransport {
  pub fn create(host: &str, port: u16) -> Result<Self, WebSocketError> {
    let socket = connect_socket(host, port)?;
    socket.set_nonblocking(true)?;
    Ok(TcpTransport { stream: socket.into() })
  }

  /// Wraps an already-connected stream; switches it to non-blocking.
  pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(TcpTransport { stream })
  }
}

impl Transport for TcpTransport {
  fn drive_handshake(&mut self) -> io::Result<bool> {
    Ok(true)
  }

  fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.stream.read(buf)
  }

  fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.stream.write(buf)
  }

  fn pending(&self) -> usize {
    0
  }

  fn nic_timestamp(&self) -> Option<NicTimestamp> {
    None
  }

  fn raw_fd(&self) -> Option<RawFd> {
    Some(self.stream.as_raw_fd())
  }
}

/// Transport selected by URL scheme: `ws://` plain, `wss://` TLS.
pub enum MaybeTlsTransport {
  Plain(TcpTransport),
  Tls(TlsTransport),
}

impl Transport for MaybeTlsTransport {
  fn drive_handshake(&mut self) -> io::Result<bool> {
    match self {
      MaybeTlsTransport::Plain(t) => t.drive_handshake(),
      MaybeTlsTransport::Tls(t) => t.drive_handshake(),
    }
  }

  fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match self {
      MaybeTlsTransport::Plain(t) => t.read_into(buf),
      MaybeTlsTransport::Tls(t) => t.read_into(buf),
    }
  }

  fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
    match self {
      MaybeTlsTransport::Plain(t) => t.send(buf),
      MaybeTlsTransport::Tls(t) => t.send(buf),
    }
  }

  fn pending(&self) -> usize {
    match self {
      MaybeTlsTransport::Plain(t) => t.pending(),
      MaybeTlsTransport::Tls(t) => t.pending(),
    }
  }

  fn nic_timestamp(&self) -> Option<NicTimestamp> {
    match self {
      MaybeTlsTransport::Plain(t) => t.nic_timestamp(),
      MaybeTlsTransport::Tls(t) => t.nic_timestamp(),
    }
  }

  fn raw_fd(&self) -> Option<RawFd> {
    match self {
      MaybeTlsTransport::Plain(t) => t.raw_fd(),
      MaybeTlsTransport::Tls(t) => t.raw_fd(),
    }
  }
}
