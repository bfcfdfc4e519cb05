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

//! TLS transport: OpenSSL session driving, kernel-TLS offload detection and
//! NIC receive-timestamp capture from socket control messages.
//!
//! The TCP connect is time-bounded and the TLS handshake runs on a blocking
//! socket; once established the socket flips to non-blocking and every
//! operation becomes a would-block-or-progress affair suitable for an event
//! loop.

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Once;

use openssl::ssl::{
  ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslContext,
  SslContextBuilder, SslMethod, SslOptions, SslStream, SslVerifyMode,
  SslVersion,
};
use socket2::Socket;

use crate::error::WebSocketError;
use crate::transport::{
  connect_socket, NicTimestamp, TimestampSource, Transport,
};

/// TLS 1.2 cipher list installed by default: AES-GCM first so AES-NI /
/// ARMv8-CE hardware carries the record path, and so kTLS (AES-GCM only on
/// older kernels) can engage.
const DEFAULT_CIPHER_LIST: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:\
                                   ECDHE-RSA-AES128-GCM-SHA256:\
                                   ECDHE-ECDSA-AES256-GCM-SHA384:\
                                   ECDHE-RSA-AES256-GCM-SHA384:\
                                   ECDHE-ECDSA-CHACHA20-POLY1305:\
                                   ECDHE-RSA-CHACHA20-POLY1305";

const DEFAULT_TLS13_SUITES: &str =
  "TLS_AES_128_GCM_SHA256:TLS_AES_256_GCM_SHA384";

#[cfg(target_os = "linux")]
mod sys {
  // SO_TIMESTAMPING flag bits, <linux/net_tstamp.h>.
  pub const SOF_TIMESTAMPING_RX_HARDWARE: libc::c_uint = 1 << 2;
  pub const SOF_TIMESTAMPING_RX_SOFTWARE: libc::c_uint = 1 << 3;
  pub const SOF_TIMESTAMPING_SOFTWARE: libc::c_uint = 1 << 4;
  pub const SOF_TIMESTAMPING_RAW_HARDWARE: libc::c_uint = 1 << 6;

  // SCM_TIMESTAMPING aliases SO_TIMESTAMPING on every Linux arch.
  pub const SCM_TIMESTAMPING: libc::c_int = libc::SO_TIMESTAMPING;

  // Kernel TLS, <linux/tls.h> and <netinet/tcp.h>.
  pub const SOL_TLS: libc::c_int = 282;
  pub const TLS_TX: libc::c_int = 1;
  pub const TLS_RX: libc::c_int = 2;
  pub const TCP_ULP: libc::c_int = 31;

  // SSL_OP_ENABLE_KTLS, OpenSSL 3.0. Harmless to request when the library
  // or kernel cannot honour it.
  pub const SSL_OP_ENABLE_KTLS: u64 = 1 << 3;
}

/// Whether the record path runs in the kernel or in userspace OpenSSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
  Kernel,
  Userspace,
}

fn tls_init() {
  static INIT: Once = Once::new();
  // Process-wide library state; initialized once, never torn down.
  INIT.call_once(openssl::init);
}

fn env_flag(name: &str) -> bool {
  std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

/// The socket under the TLS session. Its `Read` side uses the control
/// message form of the receive syscall so RX timestamps requested with
/// `SO_TIMESTAMPING` are captured on the same call that moves the bytes,
/// whether those bytes are ciphertext (userspace TLS) or plaintext (kTLS).
pub(crate) struct TimestampSocket {
  socket: Socket,
  hw_timestamping: bool,
  last_ts: Cell<Option<NicTimestamp>>,
}

impl TimestampSocket {
  fn new(socket: Socket, hw_timestamping: bool) -> Self {
    TimestampSocket { socket, hw_timestamping, last_ts: Cell::new(None) }
  }

  fn last_timestamp(&self) -> Option<NicTimestamp> {
    self.last_ts.get()
  }

  fn set_nonblocking(&self) -> io::Result<()> {
    self.socket.set_nonblocking(true)
  }

  #[cfg(target_os = "linux")]
  fn recv_with_timestamps(&self, buf: &mut [u8]) -> io::Result<usize> {
    if !self.hw_timestamping {
      return self.recv_plain(buf);
    }

    const CMSG_CAP: usize = 128;
    let mut cmsg = [0u8; CMSG_CAP];
    let mut iov = libc::iovec {
      iov_base: buf.as_mut_ptr().cast(),
      iov_len: buf.len(),
    };
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg.as_mut_ptr().cast();
    hdr.msg_controllen = CMSG_CAP as _;

    let n = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut hdr, 0) };
    if n < 0 {
      return Err(io::Error::last_os_error());
    }
    if let Some(ts) = scm_timestamping(&hdr) {
      self.last_ts.set(Some(ts));
    }
    Ok(n as usize)
  }

  #[cfg(not(target_os = "linux"))]
  fn recv_with_timestamps(&self, buf: &mut [u8]) -> io::Result<usize> {
    self.recv_plain(buf)
  }

  fn recv_plain(&self, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
      libc::recv(
        self.socket.as_raw_fd(),
        buf.as_mut_ptr().cast(),
        buf.len(),
        0,
      )
    };
    if n < 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
  }

  fn send_bytes(&self, buf: &[u8]) -> io::Result<usize> {
    #[cfg(target_os = "linux")]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    let n = unsafe {
      libc::send(self.socket.as_raw_fd(), buf.as_ptr().cast(), buf.len(), flags)
    };
    if n < 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
  }
}

impl Read for TimestampSocket {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.recv_with_timestamps(buf)
  }
}

impl Write for TimestampSocket {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.send_bytes(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

enum Session {
  /// TCP established, TLS not yet started.
  Connected(TimestampSocket),
  Handshaking(MidHandshakeSslStream<TimestampSocket>),
  Active(SslStream<TimestampSocket>),
  Failed,
}

/// TLS client transport over a single IPv4 TCP connection.
pub struct TlsTransport {
  session: Session,
  host: String,
  fd: RawFd,
  hw_timestamping: bool,
  ktls_send: bool,
  ktls_recv: bool,
}

impl TlsTransport {
  /// Resolves `host`, connects with a 5-second bound, tunes the socket and
  /// requests hardware RX timestamping. The TLS handshake itself is driven
  /// later by [`drive_handshake`](Transport::drive_handshake).
  pub fn create(host: &str, port: u16) -> Result<Self, WebSocketError> {
    tls_init();

    let socket = connect_socket(host, port)?;
    let fd = socket.as_raw_fd();
    let hw_timestamping = enable_rx_timestamping(&socket);

    Ok(TlsTransport {
      session: Session::Connected(TimestampSocket::new(socket, hw_timestamping)),
      host: host.to_string(),
      fd,
      hw_timestamping,
      ktls_send: false,
      ktls_recv: false,
    })
  }

  pub fn mode(&self) -> TlsMode {
    if self.ktls_send || self.ktls_recv {
      TlsMode::Kernel
    } else {
      TlsMode::Userspace
    }
  }

  pub fn cipher_name(&self) -> Option<&'static str> {
    match &self.session {
      Session::Active(stream) => {
        stream.ssl().current_cipher().map(|c| c.name())
      }
      _ => None,
    }
  }

  pub fn has_aes_hw(&self) -> bool {
    #[cfg(target_arch = "x86_64")]
    {
      is_x86_feature_detected!("aes")
    }
    #[cfg(target_arch = "aarch64")]
    {
      std::arch::is_aarch64_feature_detected!("aes")
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
      false
    }
  }

  pub fn hw_timestamping_enabled(&self) -> bool {
    self.hw_timestamping
  }

  fn build_ssl(&self) -> Result<Ssl, openssl::error::ErrorStack> {
    let mut builder = SslContext::builder(SslMethod::tls_client())?;
    builder.set_verify(SslVerifyMode::NONE);
    configure_protocol_versions(&mut builder)?;
    configure_ciphers(&mut builder)?;

    #[cfg(target_os = "linux")]
    builder.set_options(SslOptions::from_bits_retain(sys::SSL_OP_ENABLE_KTLS));

    let ctx = builder.build();
    let mut ssl = Ssl::new(&ctx)?;
    ssl.set_hostname(&self.host)?;
    Ok(ssl)
  }

  fn finish_handshake(
    &mut self,
    stream: SslStream<TimestampSocket>,
  ) -> io::Result<bool> {
    stream.get_ref().set_nonblocking()?;

    self.ktls_send = probe_ktls(self.fd, Direction::Tx);
    self.ktls_recv = probe_ktls(self.fd, Direction::Rx);
    if env_flag("WS_DEBUG_KTLS") {
      log::warn!(
        "ktls: ulp={} tx={} rx={} cipher={:?}",
        probe_tcp_ulp(self.fd),
        self.ktls_send,
        self.ktls_recv,
        stream.ssl().current_cipher().map(|c| c.name()),
      );
    } else {
      log::debug!("ktls tx={} rx={}", self.ktls_send, self.ktls_recv);
    }

    self.session = Session::Active(stream);
    Ok(true)
  }

  fn handshake_step(
    &mut self,
    result: Result<SslStream<TimestampSocket>, HandshakeError<TimestampSocket>>,
  ) -> io::Result<bool> {
    match result {
      Ok(stream) => self.finish_handshake(stream),
      Err(HandshakeError::WouldBlock(mid)) => {
        self.session = Session::Handshaking(mid);
        Ok(false)
      }
      Err(HandshakeError::Failure(mid)) => {
        if env_flag("WS_DEBUG") {
          log::warn!(
            "tls handshake failed: {} (verify: {})",
            mid.error(),
            mid.ssl().verify_result().error_string()
          );
        }
        self.session = Session::Failed;
        Err(io::Error::new(
          io::ErrorKind::InvalidData,
          mid.error().to_string(),
        ))
      }
      Err(HandshakeError::SetupFailure(stack)) => {
        self.session = Session::Failed;
        Err(io::Error::new(io::ErrorKind::InvalidData, stack.to_string()))
      }
    }
  }
}

impl Transport for TlsTransport {
  fn drive_handshake(&mut self) -> io::Result<bool> {
    match std::mem::replace(&mut self.session, Session::Failed) {
      Session::Connected(socket) => {
        let ssl = self
          .build_ssl()
          .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let result = ssl.connect(socket);
        self.handshake_step(result)
      }
      Session::Handshaking(mid) => {
        let result = mid.handshake();
        self.handshake_step(result)
      }
      Session::Active(stream) => {
        self.session = Session::Active(stream);
        Ok(true)
      }
      Session::Failed => {
        Err(io::Error::new(io::ErrorKind::NotConnected, "tls session failed"))
      }
    }
  }

  fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match &mut self.session {
      Session::Active(stream) => {
        #[cfg(target_os = "linux")]
        if self.ktls_recv {
          // The kernel decrypts in place; read plaintext straight off the
          // socket and collect timestamps from the same syscall.
          return stream.get_ref().recv_with_timestamps(buf);
        }

        match stream.ssl_read(buf) {
          Ok(n) => Ok(n),
          Err(e) => match e.code() {
            ErrorCode::ZERO_RETURN => Ok(0),
            ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
              Err(io::ErrorKind::WouldBlock.into())
            }
            _ => Err(into_io_error(e)),
          },
        }
      }
      _ => Err(io::ErrorKind::NotConnected.into()),
    }
  }

  fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
    match &mut self.session {
      Session::Active(stream) => match stream.ssl_write(buf) {
        Ok(n) => Ok(n),
        Err(e) => match e.code() {
          ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
            Err(io::ErrorKind::WouldBlock.into())
          }
          ErrorCode::ZERO_RETURN => {
            Err(io::ErrorKind::ConnectionAborted.into())
          }
          _ => Err(into_io_error(e)),
        },
      },
      _ => Err(io::ErrorKind::NotConnected.into()),
    }
  }

  fn pending(&self) -> usize {
    match &self.session {
      Session::Active(stream) => stream.ssl().pending(),
      _ => 0,
    }
  }

  fn nic_timestamp(&self) -> Option<NicTimestamp> {
    match &self.session {
      Session::Active(stream) => stream.get_ref().last_timestamp(),
      Session::Handshaking(mid) => mid.get_ref().last_timestamp(),
      _ => None,
    }
  }

  fn raw_fd(&self) -> Option<RawFd> {
    Some(self.fd)
  }
}

fn into_io_error(e: openssl::ssl::Error) -> io::Error {
  match e.into_io_error() {
    Ok(io) => io,
    Err(e) => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
  }
}

fn configure_protocol_versions(
  builder: &mut SslContextBuilder,
) -> Result<(), openssl::error::ErrorStack> {
  if env_flag("WS_FORCE_TLS13") {
    // Pinning 1.3 trades kTLS offload away on TLS-1.2-only kernels.
    builder.set_min_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
  } else {
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
  }
  Ok(())
}

fn configure_ciphers(
  builder: &mut SslContextBuilder,
) -> Result<(), openssl::error::ErrorStack> {
  match std::env::var("WS_CIPHER_LIST") {
    Ok(list) => builder.set_cipher_list(&list)?,
    Err(_) => builder.set_cipher_list(DEFAULT_CIPHER_LIST)?,
  }
  match std::env::var("WS_TLS13_CIPHERSUITES") {
    Ok(suites) => builder.set_ciphersuites(&suites)?,
    Err(_) => builder.set_ciphersuites(DEFAULT_TLS13_SUITES)?,
  }
  Ok(())
}

/// Requests hardware RX timestamps on the socket. Returns whether the
/// kernel accepted; failure downgrades to no timestamps rather than
/// failing the connection.
#[cfg(target_os = "linux")]
fn enable_rx_timestamping(socket: &Socket) -> bool {
  let flags: libc::c_uint = sys::SOF_TIMESTAMPING_RX_HARDWARE
    | sys::SOF_TIMESTAMPING_RX_SOFTWARE
    | sys::SOF_TIMESTAMPING_SOFTWARE
    | sys::SOF_TIMESTAMPING_RAW_HARDWARE;
  let rc = unsafe {
    libc::setsockopt(
      socket.as_raw_fd(),
      libc::SOL_SOCKET,
      libc::SO_TIMESTAMPING,
      (&flags as *const libc::c_uint).cast(),
      std::mem::size_of::<libc::c_uint>() as libc::socklen_t,
    )
  };
  if rc != 0 {
    log::debug!("SO_TIMESTAMPING unavailable: {}", io::Error::last_os_error());
  }
  rc == 0
}

#[cfg(not(target_os = "linux"))]
fn enable_rx_timestamping(_socket: &Socket) -> bool {
  false
}

/// Walks the control messages of a receive and extracts the preferred
/// timestamp: `SCM_TIMESTAMPING` carries `[timespec; 3]` (software, legacy,
/// hardware); hardware wins when non-zero.
#[cfg(target_os = "linux")]
fn scm_timestamping(hdr: &libc::msghdr) -> Option<NicTimestamp> {
  let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(hdr) };
  while !cmsg.is_null() {
    let c = unsafe { &*cmsg };
    if c.cmsg_level == libc::SOL_SOCKET && c.cmsg_type == sys::SCM_TIMESTAMPING
    {
      let stamps: [libc::timespec; 3] = unsafe {
        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _)
      };
      let hw = saturating_ns(&stamps[2]);
      if hw != 0 {
        return Some(NicTimestamp { ns: hw, source: TimestampSource::Hardware });
      }
      let sw = saturating_ns(&stamps[0]);
      if sw != 0 {
        return Some(NicTimestamp { ns: sw, source: TimestampSource::Software });
      }
    }
    cmsg = unsafe { libc::CMSG_NXTHDR(hdr, cmsg) };
  }
  None
}

fn saturating_ns(ts: &libc::timespec) -> u64 {
  if ts.tv_sec < 0 {
    return 0;
  }
  let sec = ts.tv_sec as u64;
  if sec > u64::MAX / 1_000_000_000 {
    return u64::MAX;
  }
  (sec * 1_000_000_000).saturating_add(ts.tv_nsec as u64)
}

enum Direction {
  Tx,
  Rx,
}

/// Reads back `TCP_ULP`; a kernel-TLS socket reports `"tls"`.
#[cfg(target_os = "linux")]
fn probe_tcp_ulp(fd: RawFd) -> bool {
  let mut name = [0u8; 16];
  let mut len = name.len() as libc::socklen_t;
  let rc = unsafe {
    libc::getsockopt(
      fd,
      libc::SOL_TCP,
      sys::TCP_ULP,
      name.as_mut_ptr().cast(),
      &mut len,
    )
  };
  rc == 0 && name.starts_with(b"tls")
}

#[cfg(not(target_os = "linux"))]
fn probe_tcp_ulp(_fd: RawFd) -> bool {
  false
}

/// Direction-specific kTLS activation probe: `getsockopt(SOL_TLS, TLS_TX |
/// TLS_RX)` only succeeds once crypto state is installed for that side.
#[cfg(target_os = "linux")]
fn probe_ktls(fd: RawFd, direction: Direction) -> bool {
  if !probe_tcp_ulp(fd) {
    return false;
  }
  let which = match direction {
    Direction::Tx => sys::TLS_TX,
    Direction::Rx => sys::TLS_RX,
  };
  // Large enough for any tls12_crypto_info_* the kernel hands back.
  let mut info = [0u8; 120];
  let mut len = info.len() as libc::socklen_t;
  let rc = unsafe {
    libc::getsockopt(fd, sys::SOL_TLS, which, info.as_mut_ptr().cast(), &mut len)
  };
  rc == 0
}

#[cfg(not(target_os = "linux"))]
fn probe_ktls(_fd: RawFd, _direction: Direction) -> bool {
  false
}
