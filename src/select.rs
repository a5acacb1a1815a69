// Copyright 2025 The sctp-channel Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// The readiness dimension a selector waits on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Interest {
    Readable,
    Writable,
    /// Completion of a pending non-blocking connect.
    Connectable,
}

impl Interest {
    fn epoll_events(self) -> u32 {
        match self {
            Interest::Readable => libc::EPOLLIN as u32,
            Interest::Writable | Interest::Connectable => libc::EPOLLOUT as u32,
        }
    }
}

/// Waits on a single readiness dimension of one socket.
///
/// Each selector owns an epoll instance with the socket registered for exactly one
/// interest, so that independent operations can wait on the same socket without
/// disturbing each other's interest sets. Waits are bounded; readiness is consumed
/// per turn and never carried over.
pub(crate) struct Selector {
    epfd: RawFd,
    closed: AtomicBool,
}

impl Selector {
    /// Creates a selector watching `fd` for `interest`.
    pub fn open(fd: RawFd, interest: Interest) -> io::Result<Selector> {
        let epfd = match unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) } {
            -1 => return Err(io::Error::last_os_error()),
            epfd => epfd,
        };
        let mut event = libc::epoll_event {
            events: interest.epoll_events() | libc::EPOLLERR as u32 | libc::EPOLLHUP as u32,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(e);
        }
        Ok(Selector { epfd, closed: AtomicBool::new(false) })
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for readiness, returning the number of selected entries.
    /// A closed selector selects nothing.
    pub fn select(&self, timeout: Duration) -> io::Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let mut event: libc::epoll_event = unsafe { mem::zeroed() };
        match unsafe { libc::epoll_wait(self.epfd, &mut event, 1, millis) } {
            -1 => {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                Err(e)
            }
            n => Ok(n as usize),
        }
    }

    /// Releases the epoll instance. Repeated calls are no-ops.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match unsafe { libc::close(self.epfd) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
