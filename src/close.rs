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

/// Status code carried by an outgoing CLOSE frame, per RFC 6455 section 7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
  /// Normal closure (1000).
  Normal,
  /// Endpoint is going away (1001).
  Away,
  /// Protocol error (1002).
  Protocol,
  /// Unsupported data (1003).
  Unsupported,
  /// Invalid payload data (1007).
  Invalid,
  /// Policy violation (1008).
  Policy,
  /// Message too big (1009).
  Size,
  /// Internal server error (1011).
  Error,
  /// Any other registered or reserved code.
  Other(u16),
}

impl From<CloseCode> for u16 {
  fn from(code: CloseCode) -> u16 {
    match code {
      CloseCode::Normal => 1000,
      CloseCode::Away => 1001,
      CloseCode::Protocol => 1002,
      CloseCode::Unsupported => 1003,
      CloseCode::Invalid => 1007,
      CloseCode::Policy => 1008,
      CloseCode::Size => 1009,
      CloseCode::Error => 1011,
      CloseCode::Other(code) => code,
    }
  }
}

impl From<u16> for CloseCode {
  fn from(code: u16) -> CloseCode {
    match code {
      1000 => CloseCode::Normal,
      1001 => CloseCode::Away,
      1002 => CloseCode::Protocol,
      1003 => CloseCode::Unsupported,
      1007 => CloseCode::Invalid,
      1008 => CloseCode::Policy,
      1009 => CloseCode::Size,
      1011 => CloseCode::Error,
      code => CloseCode::Other(code),
    }
  }
}
