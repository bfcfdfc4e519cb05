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

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

/// Per-connection masking key generator: xoshiro128+ seeded once from OS
/// entropy, then one 32-bit pull per outgoing frame with no further
/// syscalls.
///
/// State is wiped on drop; masking keys gate cache poisoning by
/// intermediaries, not confidentiality, so xoshiro is sufficient once the
/// seed is strong.
pub struct MaskRng {
  s: [u32; 4],
}

impl MaskRng {
  /// Seeds from the OS entropy source, falling back to a composition of
  /// wall clock, PID and two cycle-counter reads if that fails.
  pub fn from_entropy() -> Self {
    let mut seed = [0u8; 16];
    if OsRng.try_fill_bytes(&mut seed).is_err() {
      seed = fallback_seed();
    }
    let mut s = [0u32; 4];
    for (word, chunk) in s.iter_mut().zip(seed.chunks_exact(4)) {
      *word = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    // xoshiro's all-zero state is a fixed point.
    if s == [0; 4] {
      s[0] = 0x9E37_79B9;
    }
    MaskRng { s }
  }

  #[cfg(test)]
  pub(crate) fn from_state(s: [u32; 4]) -> Self {
    MaskRng { s }
  }

  #[inline]
  pub fn next_u32(&mut self) -> u32 {
    let out = self.s[0].wrapping_add(self.s[3]);
    let t = self.s[1] << 9;
    self.s[2] ^= self.s[0];
    self.s[3] ^= self.s[1];
    self.s[1] ^= self.s[2];
    self.s[0] ^= self.s[3];
    self.s[2] ^= t;
    self.s[3] = self.s[3].rotate_left(11);
    out
  }

  /// Masking key for one frame, laid out exactly as it is stored in the
  /// frame header.
  #[inline]
  pub fn next_key(&mut self) -> [u8; 4] {
    self.next_u32().to_le_bytes()
  }
}

impl Drop for MaskRng {
  fn drop(&mut self) {
    self.s.zeroize();
  }
}

/// XORs `bytes` with `key`, where `bytes` sits at `offset` within the frame
/// payload. Callable per region so a payload split across the TX ring's
/// physical wrap masks correctly.
#[inline]
pub fn apply(bytes: &mut [u8], key: [u8; 4], offset: usize) {
  for (i, b) in bytes.iter_mut().enumerate() {
    *b ^= key[(offset + i) & 3];
  }
}

pub(crate) fn fallback_seed() -> [u8; 16] {
  use std::time::{SystemTime, UNIX_EPOCH};

  let wall = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos() as u64)
    .unwrap_or(0);
  let pid = std::process::id() as u64;
  let t0 = crate::clock::raw_cycles();
  let t1 = crate::clock::raw_cycles();

  let mut seed = [0u8; 16];
  seed[..8].copy_from_slice(&(wall ^ pid.rotate_left(32)).to_le_bytes());
  seed[8..].copy_from_slice(&(t0 ^ t1.rotate_left(17)).to_le_bytes());
  seed
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn xoshiro128_plus_reference_sequence() {
    let mut rng = MaskRng::from_state([1, 2, 3, 4]);
    assert_eq!(rng.next_u32(), 5);
    assert_eq!(rng.next_u32(), 12295);
    assert_eq!(rng.next_u32(), 25178119);
  }

  #[test]
  fn key_is_little_endian_state_output() {
    let mut rng = MaskRng::from_state([1, 2, 3, 4]);
    assert_eq!(rng.next_key(), [5, 0, 0, 0]);
  }

  #[test]
  fn masking_is_self_inverse() {
    let key = [0x33, 0x22, 0x11, 0x00];
    let original = b"the quick brown fox jumps over 13 lazy dogs".to_vec();
    let mut masked = original.clone();
    apply(&mut masked, key, 0);
    assert_ne!(masked, original);
    apply(&mut masked, key, 0);
    assert_eq!(masked, original);
  }

  #[test]
  fn split_masking_matches_contiguous() {
    let key = [0xDE, 0xAD, 0xBE, 0xEF];
    let mut whole = (0u8..101).collect::<Vec<u8>>();
    let mut split = whole.clone();
    apply(&mut whole, key, 0);
    let (a, b) = split.split_at_mut(33);
    apply(a, key, 0);
    apply(b, key, 33);
    assert_eq!(whole, split);
  }

  #[test]
  fn seeded_state_is_never_all_zero() {
    let mut rng = MaskRng::from_entropy();
    // Two consecutive keys from a healthy generator differ.
    assert_ne!(rng.next_u32(), rng.next_u32());
  }
}
