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

//! Client side of the HTTP/1.1 upgrade.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::WebSocketError;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Capacity of the upgrade-response accumulation buffer.
pub const RESPONSE_BUFFER_LEN: usize = 4096;

/// A fresh `Sec-WebSocket-Key`: 16 bytes of OS entropy, base64 encoded.
pub fn generate_key() -> String {
  let mut input = [0u8; 16];
  if OsRng.try_fill_bytes(&mut input).is_err() {
    input = crate::mask::fallback_seed();
  }
  BASE64.encode(input)
}

/// The `Sec-WebSocket-Accept` value a conforming server derives from `key`.
pub fn accept_key(key: &str) -> String {
  let mut sha1 = Sha1::new();
  sha1.update(key.as_bytes());
  sha1.update(WS_GUID.as_bytes());
  BASE64.encode(sha1.finalize())
}

/// Formats the upgrade request. The `Host` port is elided at the scheme
/// default (443 for `wss`, 80 otherwise).
pub fn build_request(
  host: &str,
  port: u16,
  path: &str,
  secure: bool,
  key: &str,
) -> String {
  let default_port = if secure { 443 } else { 80 };
  let host_header = if port == default_port {
    host.to_string()
  } else {
    format!("{}:{}", host, port)
  };

  format!(
    "GET {path} HTTP/1.1\r\n\
     Host: {host_header}\r\n\
     Upgrade: websocket\r\n\
     Connection: Upgrade\r\n\
     Sec-WebSocket-Key: {key}\r\n\
     Sec-WebSocket-Version: 13\r\n\
     \r\n"
  )
}

/// Parses the accumulated upgrade response.
///
/// Returns `Ok(None)` while the header block is still incomplete. On
/// success returns the header block length; any bytes past it are the first
/// frames and belong to the RX ring. Only `101 Switching Protocols`
/// qualifies; an absent or wrong `Upgrade` header or a
/// `Sec-WebSocket-Accept` that does not match `expected_accept` fails the
/// connection.
pub fn parse_response(
  buf: &[u8],
  expected_accept: &str,
) -> Result<Option<usize>, WebSocketError> {
  let mut headers = [httparse::EMPTY_HEADER; 32];
  let mut response = httparse::Response::new(&mut headers);

  let header_len = match response.parse(buf) {
    Ok(httparse::Status::Complete(n)) => n,
    Ok(httparse::Status::Partial) => return Ok(None),
    Err(_) => return Err(WebSocketError::MalformedUpgradeResponse),
  };

  match response.code {
    Some(101) => {}
    Some(code) => return Err(WebSocketError::UpgradeRejected(code)),
    None => return Err(WebSocketError::MalformedUpgradeResponse),
  }

  let upgrade = header_value(response.headers, "upgrade")
    .ok_or(WebSocketError::MissingUpgradeHeader)?;
  if !upgrade.eq_ignore_ascii_case(b"websocket") {
    return Err(WebSocketError::MissingUpgradeHeader);
  }

  let accept = header_value(response.headers, "sec-websocket-accept")
    .ok_or(WebSocketError::AcceptKeyMismatch)?;
  if accept != expected_accept.as_bytes() {
    return Err(WebSocketError::AcceptKeyMismatch);
  }

  Ok(Some(header_len))
}

fn header_value<'a>(
  headers: &'a [httparse::Header<'a>],
  name: &str,
) -> Option<&'a [u8]> {
  headers
    .iter()
    .find(|h| h.name.eq_ignore_ascii_case(name))
    .map(|h| h.value)
}

#[cfg(test)]
mod tests {
  use super::*;

  // RFC 6455 section 1.3 example.
  const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
  const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

  fn response_for(accept: &str) -> String {
    format!(
      "HTTP/1.1 101 Switching Protocols\r\n\
       Upgrade: websocket\r\n\
       Connection: Upgrade\r\n\
       Sec-WebSocket-Accept: {accept}\r\n\
       \r\n"
    )
  }

  #[test]
  fn accept_key_matches_rfc_vector() {
    assert_eq!(accept_key(RFC_KEY), RFC_ACCEPT);
  }

  #[test]
  fn generated_keys_are_unique_base64() {
    let a = generate_key();
    let b = generate_key();
    assert_eq!(a.len(), 24);
    assert_ne!(a, b);
    assert_eq!(BASE64.decode(&a).unwrap().len(), 16);
  }

  #[test]
  fn request_contains_required_headers() {
    let req = build_request("example.com", 9443, "/stream", true, RFC_KEY);
    assert!(req.starts_with("GET /stream HTTP/1.1\r\n"));
    assert!(req.contains("Host: example.com:9443\r\n"));
    assert!(req.contains("Upgrade: websocket\r\n"));
    assert!(req.contains("Connection: Upgrade\r\n"));
    assert!(req.contains(&format!("Sec-WebSocket-Key: {RFC_KEY}\r\n")));
    assert!(req.contains("Sec-WebSocket-Version: 13\r\n"));
    assert!(req.ends_with("\r\n\r\n"));
  }

  #[test]
  fn host_port_elided_at_scheme_default() {
    let req = build_request("example.com", 443, "/", true, RFC_KEY);
    assert!(req.contains("Host: example.com\r\n"));
    let req = build_request("example.com", 80, "/", false, RFC_KEY);
    assert!(req.contains("Host: example.com\r\n"));
    let req = build_request("example.com", 443, "/", false, RFC_KEY);
    assert!(req.contains("Host: example.com:443\r\n"));
  }

  #[test]
  fn accepts_only_101() {
    let ok = response_for(RFC_ACCEPT);
    let n = parse_response(ok.as_bytes(), RFC_ACCEPT).unwrap().unwrap();
    assert_eq!(n, ok.len());

    let rejected = ok.replace("101 Switching Protocols", "200 OK");
    let err = parse_response(rejected.as_bytes(), RFC_ACCEPT).unwrap_err();
    assert!(matches!(err, WebSocketError::UpgradeRejected(200)));
  }

  #[test]
  fn header_names_match_case_insensitively() {
    let shouty = response_for(RFC_ACCEPT)
      .replace("Upgrade: websocket", "UPGRADE: WebSocket")
      .replace("Sec-WebSocket-Accept", "SEC-WEBSOCKET-ACCEPT");
    assert!(parse_response(shouty.as_bytes(), RFC_ACCEPT).unwrap().is_some());
  }

  #[test]
  fn missing_or_wrong_upgrade_header_fails() {
    let gone = response_for(RFC_ACCEPT).replace("Upgrade: websocket\r\n", "");
    let err = parse_response(gone.as_bytes(), RFC_ACCEPT).unwrap_err();
    assert!(matches!(err, WebSocketError::MissingUpgradeHeader));

    let wrong = response_for(RFC_ACCEPT).replace("websocket", "h2c");
    let err = parse_response(wrong.as_bytes(), RFC_ACCEPT).unwrap_err();
    assert!(matches!(err, WebSocketError::MissingUpgradeHeader));
  }

  #[test]
  fn accept_mismatch_fails() {
    let bad = response_for("AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
    let err = parse_response(bad.as_bytes(), RFC_ACCEPT).unwrap_err();
    assert!(matches!(err, WebSocketError::AcceptKeyMismatch));
  }

  #[test]
  fn partial_response_waits() {
    let full = response_for(RFC_ACCEPT);
    let partial = &full.as_bytes()[..full.len() - 10];
    assert!(parse_response(partial, RFC_ACCEPT).unwrap().is_none());
  }

  #[test]
  fn trailing_bytes_belong_to_the_stream() {
    let mut wire = response_for(RFC_ACCEPT).into_bytes();
    let header_len = wire.len();
    wire.extend_from_slice(&[0x81, 0x02, 0x68, 0x69]);
    let n = parse_response(&wire, RFC_ACCEPT).unwrap().unwrap();
    assert_eq!(n, header_len);
  }
}
