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

//! Counting notification primitives built on Linux eventfd.

use std::io;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counting notification primitive which can be watched by a [`Reactor`].
///
/// Each [`Event::notify`] adds a single count to the underlying eventfd and
/// each [`Event::read`] consumes a single count (semaphore mode), so a burst
/// of notifications arriving between two dispatch passes produces exactly as
/// many readiness events as there were notifications - none are coalesced
/// away.
///
/// The event is owned by whoever constructs it; a reactor only learns its
/// identity when the owner registers it as a watched descriptor. The
/// underlying descriptor is closed when the event is dropped, and must not
/// be dropped while still registered with a reactor.
///
/// [`Reactor`]: crate::Reactor
#[derive(Debug)]
pub struct Event {
    fd: RawFd,
}

impl Event {
    /// Opens a new eventfd in non-blocking, semaphore-decrement mode.
    pub fn new() -> io::Result<Event> {
        let fd = unsafe {
            libc::eventfd(0, libc::EFD_SEMAPHORE | libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Event { fd })
    }

    /// Adds a single count, making the descriptor read-ready.
    ///
    /// # Panics
    ///
    /// Panics on an OS error; the counter overflowing is not an expected
    /// condition and has no recovery.
    pub fn notify(&self) {
        let val = 1u64;
        let res = unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, size_of::<u64>())
        };
        assert!(res != -1, "could not notify eventfd {}: {}", self.fd, io::Error::last_os_error());
    }

    /// Consumes a single count. Returns `false` if the counter was zero.
    pub fn read(&self) -> bool {
        let mut val = 0u64;
        let res = unsafe {
            libc::read(self.fd, &mut val as *mut u64 as *mut libc::c_void, size_of::<u64>())
        };
        res != -1
    }

    /// Drains the counter to zero.
    pub fn clear(&self) {
        while self.read() {}
    }

    /// Returns the descriptor identifying this event, suitable for
    /// registration with a reactor.
    pub fn id(&self) -> RawFd {
        self.fd
    }
}

impl AsRawFd for Event {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        let res = unsafe { libc::close(self.fd) };
        debug_assert!(res != -1, "could not close eventfd {}", self.fd);
    }
}

/// Wakeable used by the reactor to receive out-of-band commands while it is
/// blocked in the kernel readiness call.
///
/// Posted command bitflags accumulate on a pending mask and the eventfd
/// (plain, non-semaphore mode) wakes the reactor thread; a single
/// [`ControlChannel::take`] collects them all, coalescing simultaneous
/// commands into one wakeup. The mask is kept beside the counter rather
/// than on it, so that repeated posts of the same command OR together
/// instead of summing into a different command.
#[derive(Debug)]
pub(crate) struct ControlChannel {
    fd: RawFd,
    commands: AtomicU64,
}

impl ControlChannel {
    pub(crate) fn new() -> io::Result<ControlChannel> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(ControlChannel {
            fd,
            commands: AtomicU64::new(0),
        })
    }

    /// Merges command bits into the pending mask and wakes the reactor
    /// thread.
    ///
    /// # Panics
    ///
    /// Panics on an OS error: a reactor whose control channel cannot be
    /// written can no longer be stopped.
    pub(crate) fn post(&self, flags: u64) {
        self.commands.fetch_or(flags, Ordering::AcqRel);
        let val = 1u64;
        let res = unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, size_of::<u64>())
        };
        assert!(
            res != -1,
            "could not write to the reactor control channel: {}",
            io::Error::last_os_error()
        );
    }

    /// Takes all pending command bits, resetting the mask and draining the
    /// wakeup counter. Returns 0 when a wakeup raced with a command already
    /// collected by an earlier call.
    pub(crate) fn take(&self) -> u64 {
        let mut val = 0u64;
        unsafe {
            libc::read(self.fd, &mut val as *mut u64 as *mut libc::c_void, size_of::<u64>());
        }
        self.commands.swap(0, Ordering::AcqRel)
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        let res = unsafe { libc::close(self.fd) };
        debug_assert!(res != -1, "could not close the reactor control channel {}", self.fd);
    }
}
