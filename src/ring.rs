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

//! Single-producer single-consumer byte ring.
//!
//! The backing storage is, in order of preference, a page-mirrored double
//! mapping (the first `N` bytes and the next `N` bytes alias the same
//! physical frames, so any region of length <= N is addressable as one flat
//! slice), a huge-page/madvised anonymous mapping, or a cache-line-aligned
//! heap allocation. One byte is reserved to distinguish empty from full.
//!
//! Offsets are `AtomicUsize` in separate cache lines; `commit_write` stores
//! with `Release` and the peer offset is loaded with `Acquire`, so the ring
//! is safe under a true two-thread SPSC split even though this engine
//! drives both sides from one thread.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::WebSocketError;
use crate::mask;

/// Default capacity of the RX and TX rings: 8 MiB.
pub const DEFAULT_RING_CAPACITY: usize = 1 << 23;

#[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
const CACHE_LINE: usize = 128;
#[cfg(not(all(target_arch = "aarch64", target_vendor = "apple")))]
const CACHE_LINE: usize = 64;

#[cfg_attr(
  all(target_arch = "aarch64", target_vendor = "apple"),
  repr(align(128))
)]
#[cfg_attr(
  not(all(target_arch = "aarch64", target_vendor = "apple")),
  repr(align(64))
)]
struct CachePadded<T>(T);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
  /// Double mapping spanning `2 * capacity`.
  Mirrored,
  /// Single anonymous mapping of `capacity` (huge pages or madvised).
  Mapped,
  /// Aligned heap allocation.
  Heap,
}

pub struct RingBuffer {
  base: NonNull<u8>,
  cap: usize,
  backing: Backing,
  write_off: CachePadded<AtomicUsize>,
  read_off: CachePadded<AtomicUsize>,
}

// The producer and consumer sides may live on different threads; the
// offsets carry the ordering.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
  /// Allocates a ring of `cap` bytes (`cap` must be a power of two).
  ///
  /// Tries virtual-memory mirroring first, then a huge-page or madvised
  /// anonymous mapping, then the heap.
  pub fn with_capacity(cap: usize) -> Result<Self, WebSocketError> {
    assert!(cap.is_power_of_two(), "ring capacity must be a power of two");
    assert!(cap >= 2);

    if let Some(ring) = Self::mirrored(cap) {
      return Ok(ring);
    }
    if let Some(ring) = Self::mapped(cap) {
      return Ok(ring);
    }
    Self::heap(cap)
  }

  fn mirrored(cap: usize) -> Option<Self> {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 || cap % page as usize != 0 {
      return None;
    }
    let span = cap.checked_mul(2)?;

    unsafe {
      // Reserve the full span so nothing else lands between the halves.
      let base = libc::mmap(
        std::ptr::null_mut(),
        span,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      );
      if base == libc::MAP_FAILED {
        return None;
      }

      let fd = match shared_object_fd(cap) {
        Some(fd) => fd,
        None => {
          libc::munmap(base, span);
          return None;
        }
      };

      let lo = libc::mmap(
        base,
        cap,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED,
        fd,
        0,
      );
      let hi = libc::mmap(
        base.add(cap),
        cap,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED,
        fd,
        0,
      );
      libc::close(fd);

      if lo != base || hi != base.add(cap) {
        libc::munmap(base, span);
        return None;
      }

      log::trace!("ring: mirrored mapping of {} bytes", cap);
      Some(Self::from_raw(base.cast(), cap, Backing::Mirrored))
    }
  }

  fn mapped(cap: usize) -> Option<Self> {
    unsafe {
      #[cfg(target_os = "linux")]
      let base = libc::mmap(
        std::ptr::null_mut(),
        cap,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
        -1,
        0,
      );
      #[cfg(not(target_os = "linux"))]
      let base = {
        let base = libc::mmap(
          std::ptr::null_mut(),
          cap,
          libc::PROT_READ | libc::PROT_WRITE,
          libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
          -1,
          0,
        );
        if base != libc::MAP_FAILED {
          libc::madvise(base, cap, libc::MADV_WILLNEED);
        }
        base
      };

      if base == libc::MAP_FAILED {
        return None;
      }
      log::trace!("ring: anonymous mapping of {} bytes", cap);
      Some(Self::from_raw(base.cast(), cap, Backing::Mapped))
    }
  }

  pub(crate) fn heap(cap: usize) -> Result<Self, WebSocketError> {
    assert!(cap.is_power_of_two() && cap >= 2);
    let layout = Layout::from_size_align(cap, CACHE_LINE)
      .map_err(|_| WebSocketError::RingSetup)?;
    let base = unsafe { alloc(layout) };
    if base.is_null() {
      return Err(WebSocketError::RingSetup);
    }
    Ok(unsafe { Self::from_raw(base, cap, Backing::Heap) })
  }

  unsafe fn from_raw(base: *mut u8, cap: usize, backing: Backing) -> Self {
    RingBuffer {
      base: NonNull::new_unchecked(base),
      cap,
      backing,
      write_off: CachePadded(AtomicUsize::new(0)),
      read_off: CachePadded(AtomicUsize::new(0)),
    }
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.cap
  }

  #[inline]
  pub fn is_mirrored(&self) -> bool {
    self.backing == Backing::Mirrored
  }

  #[inline]
  pub fn is_mmap(&self) -> bool {
    matches!(self.backing, Backing::Mirrored | Backing::Mapped)
  }

  #[inline]
  fn index_mask(&self) -> usize {
    self.cap - 1
  }

  /// Bytes the consumer may read.
  #[inline]
  pub fn available_read(&self) -> usize {
    let w = self.write_off.0.load(Ordering::Acquire);
    let r = self.read_off.0.load(Ordering::Relaxed);
    w.wrapping_sub(r) & self.index_mask()
  }

  /// Bytes the producer may write. One slot stays reserved.
  #[inline]
  pub fn available_write(&self) -> usize {
    let w = self.write_off.0.load(Ordering::Relaxed);
    let r = self.read_off.0.load(Ordering::Acquire);
    r.wrapping_sub(w).wrapping_sub(1) & self.index_mask()
  }

  /// The producer's writable region.
  ///
  /// Mirrored rings always return the full `available_write` contiguously;
  /// otherwise the region stops at the physical wrap and a second call
  /// after `commit_write` yields the remainder.
  #[inline]
  pub fn write_region(&self) -> (*mut u8, usize) {
    let w = self.write_off.0.load(Ordering::Relaxed);
    let avail = self.available_write();
    let len = if self.is_mirrored() { avail } else { avail.min(self.cap - w) };
    (unsafe { self.base.as_ptr().add(w) }, len)
  }

  /// The consumer's readable region, without consuming it.
  #[inline]
  pub fn read_region(&self) -> (*const u8, usize) {
    let r = self.read_off.0.load(Ordering::Relaxed);
    let avail = self.available_read();
    let len = if self.is_mirrored() { avail } else { avail.min(self.cap - r) };
    (unsafe { self.base.as_ptr().add(r) }, len)
  }

  #[inline]
  pub fn peek_region(&self) -> (*const u8, usize) {
    self.read_region()
  }

  /// Publishes `n` produced bytes (clamped to `available_write`).
  #[inline]
  pub fn commit_write(&self, n: usize) {
    let n = n.min(self.available_write());
    let w = self.write_off.0.load(Ordering::Relaxed);
    self.write_off.0.store((w + n) & self.index_mask(), Ordering::Release);
  }

  /// Releases `n` consumed bytes (clamped to `available_read`).
  #[inline]
  pub fn advance_read(&self, n: usize) {
    let n = n.min(self.available_read());
    let r = self.read_off.0.load(Ordering::Relaxed);
    self.read_off.0.store((r + n) & self.index_mask(), Ordering::Release);
  }

  /// Copies `src` into uncommitted producer space starting `offset` bytes
  /// past `write_offset`. Nothing is visible to the consumer until
  /// `commit_write` covers it. Returns false if it does not fit.
  pub fn stage(&self, offset: usize, src: &[u8]) -> bool {
    self.stage_with(offset, src, None)
  }

  /// Like [`stage`](Self::stage), XORing with `key` on the way in. The key
  /// phase starts at zero for `src[0]`, so a frame payload staged in one
  /// call masks exactly as RFC 6455 requires.
  pub fn stage_masked(&self, offset: usize, src: &[u8], key: [u8; 4]) -> bool {
    self.stage_with(offset, src, Some(key))
  }

  fn stage_with(&self, offset: usize, src: &[u8], key: Option<[u8; 4]>) -> bool {
    match offset.checked_add(src.len()) {
      Some(end) if end <= self.available_write() => {}
      _ => return false,
    }

    let w = self.write_off.0.load(Ordering::Relaxed);
    let start = (w + offset) & self.index_mask();

    unsafe {
      if self.is_mirrored() || start + src.len() <= self.cap {
        let dst =
          std::slice::from_raw_parts_mut(self.base.as_ptr().add(start), src.len());
        dst.copy_from_slice(src);
        if let Some(key) = key {
          mask::apply(dst, key, 0);
        }
      } else {
        let first = self.cap - start;
        let dst =
          std::slice::from_raw_parts_mut(self.base.as_ptr().add(start), first);
        dst.copy_from_slice(&src[..first]);
        if let Some(key) = key {
          mask::apply(dst, key, 0);
        }
        let rest = src.len() - first;
        let dst = std::slice::from_raw_parts_mut(self.base.as_ptr(), rest);
        dst.copy_from_slice(&src[first..]);
        if let Some(key) = key {
          mask::apply(dst, key, first);
        }
      }
    }
    true
  }

  /// Copies up to `dst.len()` readable bytes out without advancing the read
  /// cursor; returns the number copied. Used by the cold-path frame
  /// assembly on non-mirrored backings.
  pub fn peek_into(&self, dst: &mut [u8]) -> usize {
    let avail = self.available_read();
    let n = dst.len().min(avail);
    let r = self.read_off.0.load(Ordering::Relaxed);

    unsafe {
      if self.is_mirrored() || r + n <= self.cap {
        std::ptr::copy_nonoverlapping(self.base.as_ptr().add(r), dst.as_mut_ptr(), n);
      } else {
        let first = self.cap - r;
        std::ptr::copy_nonoverlapping(
          self.base.as_ptr().add(r),
          dst.as_mut_ptr(),
          first,
        );
        std::ptr::copy_nonoverlapping(
          self.base.as_ptr(),
          dst.as_mut_ptr().add(first),
          n - first,
        );
      }
    }
    n
  }
}

impl Drop for RingBuffer {
  fn drop(&mut self) {
    unsafe {
      match self.backing {
        Backing::Mirrored => {
          libc::munmap(self.base.as_ptr().cast(), self.cap * 2);
        }
        Backing::Mapped => {
          libc::munmap(self.base.as_ptr().cast(), self.cap);
        }
        Backing::Heap => {
          let layout = Layout::from_size_align_unchecked(self.cap, CACHE_LINE);
          dealloc(self.base.as_ptr(), layout);
        }
      }
    }
  }
}

/// A size-`cap` shared anonymous object to map twice.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn shared_object_fd(cap: usize) -> Option<libc::c_int> {
  unsafe {
    let fd = libc::memfd_create(
      b"tickws-ring\0".as_ptr().cast(),
      libc::MFD_CLOEXEC,
    );
    if fd < 0 {
      return None;
    }
    if libc::ftruncate(fd, cap as libc::off_t) != 0 {
      libc::close(fd);
      return None;
    }
    Some(fd)
  }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn shared_object_fd(cap: usize) -> Option<libc::c_int> {
  use std::ffi::CString;
  use std::sync::atomic::AtomicU64;

  static SEQ: AtomicU64 = AtomicU64::new(0);
  let name = format!(
    "/tickws-{}-{}",
    std::process::id(),
    SEQ.fetch_add(1, Ordering::Relaxed)
  );
  let name = CString::new(name).ok()?;

  unsafe {
    let fd = libc::shm_open(
      name.as_ptr(),
      libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
      0o600 as libc::c_uint,
    );
    if fd < 0 {
      return None;
    }
    // Unlink immediately; the mapping keeps the object alive.
    libc::shm_unlink(name.as_ptr());
    if libc::ftruncate(fd, cap as libc::off_t) != 0 {
      libc::close(fd);
      return None;
    }
    Some(fd)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fill(ring: &RingBuffer, bytes: &[u8]) {
    assert!(ring.stage(0, bytes));
    ring.commit_write(bytes.len());
  }

  fn drain(ring: &RingBuffer, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    assert_eq!(ring.peek_into(&mut out), n);
    ring.advance_read(n);
    out
  }

  #[test]
  fn read_write_available_sum_to_capacity_minus_one() {
    let ring = RingBuffer::heap(64).unwrap();
    assert_eq!(ring.available_read() + ring.available_write() + 1, 64);
    fill(&ring, &[1, 2, 3]);
    assert_eq!(ring.available_read() + ring.available_write() + 1, 64);
    drain(&ring, 2);
    assert_eq!(ring.available_read() + ring.available_write() + 1, 64);
  }

  #[test]
  fn offsets_move_modularly_and_levels_hold() {
    let ring = RingBuffer::heap(16).unwrap();
    // Park the offsets near the end.
    fill(&ring, &[0; 14]);
    drain(&ring, 14);
    let before = ring.available_read();

    fill(&ring, &[7; 5]);
    assert_eq!(ring.available_read(), before + 5);
    assert_eq!(drain(&ring, 5), vec![7; 5]);
    assert_eq!(ring.available_read(), before);
  }

  #[test]
  fn one_byte_write_wraps_at_capacity_boundary() {
    let ring = RingBuffer::heap(16).unwrap();
    fill(&ring, &[0; 15]);
    drain(&ring, 15);
    // write_offset is now 15 == cap - 1.
    fill(&ring, &[0xAB]);
    let (_, len) = ring.write_region();
    // Producer region starts back at physical offset 0.
    assert!(len > 0);
    assert_eq!(drain(&ring, 1), vec![0xAB]);
  }

  #[test]
  fn non_mirrored_split_write_lands_in_order() {
    let ring = RingBuffer::heap(16).unwrap();
    fill(&ring, &[0; 14]);
    drain(&ring, 14);
    // 3 bytes starting at offset 14 must split 2 + 1.
    fill(&ring, &[1, 2, 3]);
    let (_, first) = ring.read_region();
    assert_eq!(first, 2);
    assert_eq!(drain(&ring, 3), vec![1, 2, 3]);
  }

  #[test]
  fn stage_is_invisible_until_commit() {
    let ring = RingBuffer::heap(64).unwrap();
    assert!(ring.stage(0, &[9, 9]));
    assert_eq!(ring.available_read(), 0);
    ring.commit_write(2);
    assert_eq!(ring.available_read(), 2);
  }

  #[test]
  fn stage_rejects_overflow() {
    let ring = RingBuffer::heap(8).unwrap();
    assert!(!ring.stage(0, &[0; 8]));
    assert!(ring.stage(0, &[0; 7]));
    assert!(!ring.stage(4, &[0; 4]));
  }

  #[test]
  fn stage_masked_round_trips() {
    let ring = RingBuffer::heap(32).unwrap();
    let key = [0x33, 0x22, 0x11, 0x00];
    assert!(ring.stage_masked(0, b"hi", key));
    ring.commit_write(2);
    assert_eq!(drain(&ring, 2), vec![0x68 ^ 0x33, 0x69 ^ 0x22]);
  }

  #[test]
  fn commit_and_advance_clamp() {
    let ring = RingBuffer::heap(8).unwrap();
    ring.commit_write(100);
    assert_eq!(ring.available_read(), 7);
    ring.advance_read(100);
    assert_eq!(ring.available_read(), 0);
  }

  #[test]
  fn mirrored_ring_regions_stay_contiguous() {
    let cap = 1 << 16;
    let ring = RingBuffer::with_capacity(cap).unwrap();
    if !ring.is_mirrored() {
      eprintln!("mirroring unavailable here; skipping");
      return;
    }

    // Park the offsets 8 bytes before the physical end.
    let park = cap - 8;
    ring.commit_write(park);
    ring.advance_read(park);

    let payload = (0u8..16).collect::<Vec<u8>>();
    assert!(ring.stage(0, &payload));
    ring.commit_write(payload.len());

    // Readable region crosses the physical boundary yet stays flat.
    let (ptr, len) = ring.read_region();
    assert_eq!(len, 16);
    let got = unsafe { std::slice::from_raw_parts(ptr, len) };
    assert_eq!(got, &payload[..]);

    // Every live byte reads the same through both views of the mapping.
    let base = unsafe { ptr.sub(park) };
    for i in 0..16 {
      let physical = (park + i) & (cap - 1);
      unsafe {
        assert_eq!(*base.add(physical), payload[i]);
        assert_eq!(*base.add(physical + cap), payload[i]);
      }
    }
  }

  #[test]
  fn mirrored_writes_visible_through_alias() {
    let cap = 1 << 16;
    let ring = RingBuffer::with_capacity(cap).unwrap();
    if !ring.is_mirrored() {
      eprintln!("mirroring unavailable here; skipping");
      return;
    }
    let (ptr, _) = ring.write_region();
    unsafe {
      ptr.write(0x5A);
      assert_eq!(*ptr.add(cap), 0x5A);
      ptr.add(cap).write(0xA5);
      assert_eq!(*ptr, 0xA5);
    }
  }

  #[test]
  fn heap_ring_reports_backing_flags() {
    let ring = RingBuffer::heap(16).unwrap();
    assert!(!ring.is_mirrored());
    assert!(!ring.is_mmap());
  }
}
