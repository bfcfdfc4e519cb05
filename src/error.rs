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

use std::io;

/// Errors surfaced by the engine.
///
/// Protocol violations permanently close the connection; `Io` with
/// `WouldBlock` is never returned to callers (it is retried on the next
/// `update` tick).
#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
  #[error("invalid URL")]
  InvalidUrl,
  #[error("unsupported URL scheme: {0}")]
  UnsupportedScheme(String),
  #[error("hostname did not resolve to an IPv4 address")]
  DnsFailure,
  #[error("connect timed out")]
  ConnectTimeout,
  #[error("TLS handshake failed: {0}")]
  TlsHandshake(String),
  #[error("upgrade rejected with HTTP status {0}")]
  UpgradeRejected(u16),
  #[error("malformed upgrade response")]
  MalformedUpgradeResponse,
  #[error("upgrade response missing or invalid Upgrade header")]
  MissingUpgradeHeader,
  #[error("Sec-WebSocket-Accept mismatch")]
  AcceptKeyMismatch,
  #[error("upgrade response exceeded the handshake buffer")]
  HandshakeBufferOverflow,
  #[error("handshake deadline exceeded")]
  HandshakeTimeout,
  #[error("invalid frame opcode: {0}")]
  InvalidOpcode(u8),
  #[error("server sent a masked frame")]
  ServerMaskedFrame,
  #[error("non-minimal payload length encoding")]
  NonMinimalLength,
  #[error("control frame payload exceeds 125 bytes")]
  ControlFrameTooLarge,
  #[error("close frame with 1-byte payload")]
  InvalidCloseFrame,
  #[error("frame length overflows")]
  FrameLengthOverflow,
  #[error("frame does not fit in the TX ring")]
  TxRingFull,
  #[error("connection is closed")]
  ConnectionClosed,
  #[error("ring buffer allocation failed")]
  RingSetup,
  #[error(transparent)]
  Io(#[from] io::Error),
}

impl WebSocketError {
  /// Whether this error represents a protocol violation by the server.
  /// Violations close the connection without delivering the offending
  /// frame.
  pub fn is_protocol_violation(&self) -> bool {
    matches!(
      self,
      WebSocketError::InvalidOpcode(_)
        | WebSocketError::ServerMaskedFrame
        | WebSocketError::NonMinimalLength
        | WebSocketError::ControlFrameTooLarge
        | WebSocketError::InvalidCloseFrame
        | WebSocketError::FrameLengthOverflow
    )
  }
}
