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

use std::time::Instant;

use crate::transport::NicTimestamp;

/// Monotonic tick source consumed by the engine for latency probes and the
/// handshake deadline. Calibration (ticks per nanosecond) is the caller's
/// concern.
pub trait CycleClock {
  fn now_ticks(&self) -> u64;
  fn ticks_to_ns(&self, ticks: u64) -> f64;
}

/// Portable default clock: `Instant`-based, one tick per nanosecond. Good
/// enough to drive deadlines and tests without calibration.
pub struct StdClock {
  epoch: Instant,
}

impl Default for StdClock {
  fn default() -> Self {
    StdClock { epoch: Instant::now() }
  }
}

impl CycleClock for StdClock {
  #[inline]
  fn now_ticks(&self) -> u64 {
    self.epoch.elapsed().as_nanos() as u64
  }

  #[inline]
  fn ticks_to_ns(&self, ticks: u64) -> f64 {
    ticks as f64
  }
}

/// Raw CPU cycle counter clock. `ticks_per_ns` comes from an external
/// calibration pass (TSC frequency / 1e9 on x86, CNTFRQ_EL0 / 1e9 on ARM).
pub struct TscClock {
  ticks_per_ns: f64,
}

impl TscClock {
  pub fn new(ticks_per_ns: f64) -> Self {
    TscClock { ticks_per_ns }
  }
}

impl CycleClock for TscClock {
  #[inline]
  fn now_ticks(&self) -> u64 {
    raw_cycles()
  }

  #[inline]
  fn ticks_to_ns(&self, ticks: u64) -> f64 {
    ticks as f64 / self.ticks_per_ns
  }
}

/// Reads the CPU cycle counter directly.
#[inline]
pub fn raw_cycles() -> u64 {
  #[cfg(target_arch = "x86_64")]
  unsafe {
    core::arch::x86_64::_rdtsc()
  }
  #[cfg(target_arch = "aarch64")]
  unsafe {
    let ticks: u64;
    core::arch::asm!("mrs {}, cntvct_el0", out(reg) ticks, options(nomem, nostack));
    ticks
  }
  #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
  {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_nanos() as u64)
      .unwrap_or(0)
  }
}

/// The three timestamps captured per received message.
///
/// `event_tick` is taken at entry to the ingestion routine, `ssl_read_tick`
/// right after the first successful decrypt of that cycle, and `nic` is the
/// most recent NIC timestamp recovered from a socket control message.
/// Ticks are in the connection clock's unit; convert with
/// [`CycleClock::ticks_to_ns`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyProbes {
  pub event_tick: u64,
  pub ssl_read_tick: u64,
  pub nic: Option<NicTimestamp>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn std_clock_is_monotonic() {
    let clock = StdClock::default();
    let a = clock.now_ticks();
    let b = clock.now_ticks();
    assert!(b >= a);
    assert_eq!(clock.ticks_to_ns(1_000) as u64, 1_000);
  }

  #[test]
  fn raw_cycles_advances() {
    let a = raw_cycles();
    // A little work so even a coarse counter moves on.
    let mut x = 0u64;
    for i in 0..10_000u64 {
      x = x.wrapping_add(i);
    }
    std::hint::black_box(x);
    let b = raw_cycles();
    assert!(b >= a);
  }

  #[test]
  fn tsc_clock_converts_with_ratio() {
    let clock = TscClock::new(2.0);
    assert_eq!(clock.ticks_to_ns(2_000) as u64, 1_000);
  }
}
