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

use crate::error::WebSocketError;

/// Largest wire header a client frame can carry: 2 fixed bytes, 8 bytes of
/// extended length, 4 bytes of masking key.
pub const MAX_HEADER_LEN: usize = 14;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
  Continuation = 0x0,
  Text = 0x1,
  Binary = 0x2,
  Close = 0x8,
  Ping = 0x9,
  Pong = 0xA,
}

impl OpCode {
  /// Control frames are CLOSE, PING and PONG; they are limited to 125-byte
  /// payloads and are answered automatically by the engine.
  #[inline]
  pub fn is_control(self) -> bool {
    matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
  }
}

impl TryFrom<u8> for OpCode {
  type Error = WebSocketError;

  #[inline]
  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0x0 => Ok(OpCode::Continuation),
      0x1 => Ok(OpCode::Text),
      0x2 => Ok(OpCode::Binary),
      0x8 => Ok(OpCode::Close),
      0x9 => Ok(OpCode::Ping),
      0xA => Ok(OpCode::Pong),
      value => Err(WebSocketError::InvalidOpcode(value)),
    }
  }
}

/// A received frame.
///
/// The payload borrows the RX ring's readable region and is valid only until
/// `update` returns; copy it out if it must outlive the callback.
#[derive(Debug)]
pub struct Frame<'a> {
  pub opcode: OpCode,
  pub payload: &'a [u8],
}

/// Decoded wire header of an incoming frame. The payload itself is the
/// `payload_len` bytes that follow the `header_len`-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHead {
  pub opcode: OpCode,
  pub header_len: usize,
  pub payload_len: usize,
}

impl FrameHead {
  /// Header plus payload; the amount the read cursor advances once the
  /// frame is delivered.
  #[inline]
  pub fn total_len(&self) -> usize {
    // Checked at decode time.
    self.header_len + self.payload_len
  }
}

/// Parses one frame header out of the readable region of the RX ring.
///
/// Returns `Ok(None)` when the region does not yet hold the complete frame
/// (header or payload); the caller waits for more bytes. Server-to-client
/// frames must not be masked and must use minimal length encoding; either
/// violation fails the connection.
///
/// FIN and the RSV bits are not interpreted: fragmentation and extensions
/// are out of scope, so a conforming server sends FIN=1, RSV=0.
pub fn decode(region: &[u8]) -> Result<Option<FrameHead>, WebSocketError> {
  if region.len() < 2 {
    return Ok(None);
  }

  let opcode = OpCode::try_from(region[0] & 0x0F)?;
  if region[1] & 0x80 != 0 {
    return Err(WebSocketError::ServerMaskedFrame);
  }

  let length_code = region[1] & 0x7F;
  let (header_len, payload_len): (usize, usize) = match length_code {
    126 => {
      if region.len() < 4 {
        return Ok(None);
      }
      let len = u16::from_be_bytes([region[2], region[3]]) as usize;
      if len <= 125 {
        return Err(WebSocketError::NonMinimalLength);
      }
      (4, len)
    }
    127 => {
      if region.len() < 10 {
        return Ok(None);
      }
      let len = u64::from_be_bytes(region[2..10].try_into().unwrap());
      if len <= 65535 {
        return Err(WebSocketError::NonMinimalLength);
      }
      let len =
        usize::try_from(len).map_err(|_| WebSocketError::FrameLengthOverflow)?;
      (10, len)
    }
    len => (2, len as usize),
  };

  if opcode.is_control() && payload_len > 125 {
    return Err(WebSocketError::ControlFrameTooLarge);
  }
  if opcode == OpCode::Close && payload_len == 1 {
    return Err(WebSocketError::InvalidCloseFrame);
  }

  let total = header_len
    .checked_add(payload_len)
    .ok_or(WebSocketError::FrameLengthOverflow)?;
  if region.len() < total {
    return Ok(None);
  }

  Ok(Some(FrameHead { opcode, header_len, payload_len }))
}

/// Writes a client frame header into `buf` and returns its length.
///
/// FIN is always set (this client never fragments) and the MASK bit is
/// always set with `key` trailing the length, as RFC 6455 requires of
/// clients. Extended lengths are emitted big-endian at full width.
pub fn encode_header(
  buf: &mut [u8; MAX_HEADER_LEN],
  opcode: OpCode,
  payload_len: usize,
  key: [u8; 4],
) -> usize {
  buf[0] = 0x80 | opcode as u8;

  let key_at = if payload_len <= 125 {
    buf[1] = 0x80 | payload_len as u8;
    2
  } else if payload_len <= 65535 {
    buf[1] = 0x80 | 126;
    buf[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
    4
  } else {
    buf[1] = 0x80 | 127;
    buf[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
    10
  };

  buf[key_at..key_at + 4].copy_from_slice(&key);
  key_at + 4
}
