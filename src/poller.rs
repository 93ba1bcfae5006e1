// Single-threaded I/O event demultiplexer with callback-based dispatch
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2022-2024 by
//     Dr. Maxim Orlovsky <orlovsky@cyphernet.org>
//
// Copyright 2022-2024 Cyphernet Labs, IDCS, Switzerland
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Level-triggered epoll engine used by the reactor to multiplex readiness
//! events from all watched descriptors.

use std::fmt::{self, Display, Formatter};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

/// Use at most `size_of::<epoll_event>() * EPOLL_MAX_EVENTS` kernel memory
/// per dispatch pass.
const EPOLL_MAX_EVENTS: usize = 64;

/// Directions of I/O a registration is watching.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Wait for the descriptor to have data to read.
    pub read: bool,
    /// Wait for the descriptor to be ready for write operations.
    pub write: bool,
}

impl IoType {
    /// Watch the read direction only.
    pub fn read_only() -> IoType {
        IoType {
            read: true,
            write: false,
        }
    }

    /// Watch the write direction only.
    pub fn write_only() -> IoType {
        IoType {
            read: false,
            write: true,
        }
    }

    /// Watch both directions.
    pub fn read_write() -> IoType {
        IoType {
            read: true,
            write: true,
        }
    }

    // The read interest is always paired with remote-hang-up so that a peer
    // closing its end surfaces as a read event.
    pub(crate) fn epoll_flags(self) -> u32 {
        let mut flags = 0;
        if self.read {
            flags |= libc::EPOLLIN | libc::EPOLLRDHUP;
        }
        if self.write {
            flags |= libc::EPOLLOUT;
        }
        flags as u32
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (true, true) => f.write_str("read-write"),
            (true, false) => f.write_str("read-only"),
            (false, true) => f.write_str("write-only"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// Information about I/O readiness which has happened for a watched
/// descriptor.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoEv {
    /// The descriptor has data to read, has hung up (locally or remotely)
    /// or is in an error condition. All of these must be handled by the
    /// read side of a consumer, which is why they are folded together.
    pub is_readable: bool,
    /// The descriptor is ready for write operations.
    pub is_writable: bool,
}

impl IoEv {
    fn from_epoll(events: u32) -> IoEv {
        let read_flags =
            (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLRDHUP | libc::EPOLLERR) as u32;
        IoEv {
            is_readable: events & read_flags != 0,
            is_writable: events & libc::EPOLLOUT as u32 != 0,
        }
    }
}

/// Poll engine for a set of watched descriptors, backed by a Linux epoll
/// instance.
///
/// Registrations are keyed by a caller-chosen `u64` token which the kernel
/// hands back with each readiness event; the engine itself keeps no table.
/// All waits are level-triggered.
#[derive(Debug)]
pub struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    /// Creates a new epoll instance.
    pub fn new() -> io::Result<Poller> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epoll_fd })
    }

    /// Starts watching a descriptor for the given directions.
    pub fn add(&self, fd: RawFd, token: u64, io: IoType) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, io)
    }

    /// Changes the watched directions of an already-registered descriptor.
    pub fn modify(&self, fd: RawFd, token: u64, io: IoType) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, io)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, io: IoType) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: io.epoll_flags(),
            u64: token,
        };
        let res = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Stops watching a descriptor.
    ///
    /// Returns `false` when the descriptor was not registered (the owner
    /// may have closed it already, which removes it from the epoll set).
    pub fn remove(&self, fd: RawFd) -> io::Result<bool> {
        let res =
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if res == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(true)
    }

    /// Blocks until at least one watched descriptor is ready or the timeout
    /// expires (`None` waits indefinitely), filling `events` with one
    /// `(token, readiness)` pair per kernel event in kernel-delivery order.
    ///
    /// Returns the number of events; 0 means the wait timed out. At most 64
    /// events are collected per call, bounding per-pass kernel memory and
    /// latency jitter. Interruption by a signal restarts the wait
    /// transparently.
    pub fn wait(
        &self,
        events: &mut Vec<(u64, IoEv)>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        events.clear();
        let timeout_ms = timeout.map(|t| t.as_millis() as libc::c_int).unwrap_or(-1);
        let mut batch = [libc::epoll_event { events: 0, u64: 0 }; EPOLL_MAX_EVENTS];
        let count = loop {
            let res = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    batch.as_mut_ptr(),
                    EPOLL_MAX_EVENTS as libc::c_int,
                    timeout_ms,
                )
            };
            if res != -1 {
                break res as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };
        for i in 0..count {
            let ev = batch[i];
            events.push((ev.u64, IoEv::from_epoll(ev.events)));
        }
        Ok(count)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll_fd
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let res = unsafe { libc::close(self.epoll_fd) };
        debug_assert!(res != -1, "could not close epoll fd {}", self.epoll_fd);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn readiness_reporting() {
        let poller = Poller::new().unwrap();
        let (local, remote) = UnixStream::pair().unwrap();

        poller.add(local.as_raw_fd(), 7, IoType::read_only()).unwrap();

        let mut events = Vec::new();
        let count = poller.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(count, 0);

        (&remote).write_all(b"x").unwrap();
        let count = poller.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(count, 1);
        assert_eq!(events[0].0, 7);
        assert!(events[0].1.is_readable);
        assert!(!events[0].1.is_writable);
    }

    #[test]
    fn remove_tolerates_unknown_descriptor() {
        let poller = Poller::new().unwrap();
        let (local, _remote) = UnixStream::pair().unwrap();

        poller.add(local.as_raw_fd(), 1, IoType::read_write()).unwrap();
        assert!(poller.remove(local.as_raw_fd()).unwrap());
        assert!(!poller.remove(local.as_raw_fd()).unwrap());
    }

    #[test]
    fn modify_switches_directions() {
        let poller = Poller::new().unwrap();
        let (local, _remote) = UnixStream::pair().unwrap();

        poller.add(local.as_raw_fd(), 3, IoType::read_only()).unwrap();
        let mut events = Vec::new();
        let count = poller.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(count, 0);

        // A fresh socket pair is immediately write-ready.
        poller.modify(local.as_raw_fd(), 3, IoType::write_only()).unwrap();
        let count = poller.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(count, 1);
        assert!(events[0].1.is_writable);
    }

    #[test]
    fn io_type_display() {
        assert_eq!(IoType::read_only().to_string(), "read-only");
        assert_eq!(IoType::write_only().to_string(), "write-only");
        assert_eq!(IoType::read_write().to_string(), "read-write");
    }
}
