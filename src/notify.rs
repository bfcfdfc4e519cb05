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
use std::os::unix::io::RawFd;

/// Readiness interest for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
  pub readable: bool,
  pub writable: bool,
}

impl Interest {
  pub const READ: Interest = Interest { readable: true, writable: false };
  pub const READ_WRITE: Interest = Interest { readable: true, writable: true };
}

/// The epoll/kqueue wrapper the engine cooperates with. The engine itself
/// only ever calls [`modify`](EventNotifier::modify), to raise WRITE
/// interest while the TX ring holds bytes and drop it once drained.
pub trait EventNotifier {
  fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
  fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
  fn del(&mut self, fd: RawFd) -> io::Result<()>;
}

#[cfg(feature = "mio")]
mod mio_impl {
  use super::{EventNotifier, Interest};
  use mio::unix::SourceFd;
  use mio::{Registry, Token};
  use std::io;
  use std::os::unix::io::RawFd;

  /// [`EventNotifier`] over a mio [`Registry`].
  pub struct MioNotifier {
    registry: Registry,
    token: Token,
  }

  impl MioNotifier {
    pub fn new(registry: Registry, token: Token) -> Self {
      MioNotifier { registry, token }
    }
  }

  fn to_mio(interest: Interest) -> mio::Interest {
    match (interest.readable, interest.writable) {
      (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
      (false, true) => mio::Interest::WRITABLE,
      _ => mio::Interest::READABLE,
    }
  }

  impl EventNotifier for MioNotifier {
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
      self.registry.register(&mut SourceFd(&fd), self.token, to_mio(interest))
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
      self.registry.reregister(&mut SourceFd(&fd), self.token, to_mio(interest))
    }

    fn del(&mut self, fd: RawFd) -> io::Result<()> {
      self.registry.deregister(&mut SourceFd(&fd))
    }
  }
}

#[cfg(feature = "mio")]
pub use mio_impl::MioNotifier;
