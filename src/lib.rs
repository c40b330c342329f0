/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! Utilities for turning an arbitrary command into a well-behaved daemon.
//!
//! In Unix-like environments, it's traditional for a daemon process to
//! **detach** itself from its controlling terminal and run, isolated, in the
//! background, to advertise itself through a locked **pidfile** so that a
//! second copy cannot start and an administrator can find and stop the first,
//! and to react to signals such as `SIGHUP` and `SIGTERM` without doing real
//! work inside the signal handler itself.  These days much of this can be
//! delegated to an external manager (e.g. `systemd`), but a self-contained
//! daemoniser is still convenient, especially for automated testing and for
//! programs that must run under plain `init` or `inetd`.
//!
//! This crate provides the pieces and a small harness that ties them
//! together:
//!
//!   - [`daemon`]: the initialisation sequence itself, meaning the
//!     launch-context probes, the double fork, descriptor hygiene,
//!     privilege controls, and the pidfile lifecycle ([`daemon::init`],
//!     [`daemon::close`], [`daemon::is_running`], [`daemon::stop`]).
//!
//!   - [`sig`]: deferred signal dispatch.  An async-signal-safe catcher
//!     records arrivals, and [`sig::handle_all`] replays them to ordinary
//!     Rust functions from the main loop, under the proper signal mask.
//!
//!   - [`path`]: a safety auditor that decides whether a path can be
//!     trusted as privileged configuration, following symlinks and rejecting
//!     group- or world-writable components.
//!
//!   - [`config`]: a comment- and continuation-aware line parser for the
//!     audited configuration files.
//!
//!   - [`fio`]: `fcntl` locking, `O_NONBLOCK` toggles, a line reader that
//!     accepts all three newline conventions, and a fifo opener that
//!     guarantees a unique reader.
//!
//!   - [`limits`]: `PATH_MAX`/`OPEN_MAX` queries with sane fallbacks.
//!
//!   - [`supervisor`]: a [`Supervisor`](supervisor::Supervisor) harness
//!     that daemonises, spawns a client command, and applies a
//!     restart-on-error policy.
//!
//! # Safety
//!
//! [`daemon::init`] forks.  Any threads other than the calling thread will
//! be dead in the child, so it must be called while the program is still
//! single-threaded (in practice, as soon as possible after parsing
//! command-line options and installing a logging subscriber).

pub mod config;
pub mod daemon;
pub mod fio;
pub mod limits;
pub mod path;
pub mod sig;
pub mod supervisor;

pub use supervisor::Supervisor;

pub(crate) mod sys {
    //! System call wrappers.

    use std::io::Error;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    /// Forks.  Returns `Ok(Some(pid))` in the parent and `Ok(None)` in the
    /// child.
    ///
    /// # Safety
    ///
    /// Must only be called while the process is single-threaded.
    pub unsafe fn fork() -> Result<Option<libc::pid_t>, Error> {
        let pid = libc::fork();
        if pid < 0 {
            Err(Error::last_os_error())
        } else if pid == 0 {
            Ok(None)
        } else {
            Ok(Some(pid))
        }
    }

    /// Waits for `pid`.  `EINTR` is surfaced rather than retried, which
    /// gives the supervisor loop its chance to replay deferred signals
    /// before waiting again.
    pub fn waitpid(pid: libc::pid_t, flags: libc::c_int) -> Result<(libc::pid_t, ExitStatus), Error> {
        let mut status = 0;
        let retval = unsafe { libc::waitpid(pid, &mut status as *mut libc::c_int, flags) };
        if retval == -1 {
            Err(Error::last_os_error())
        } else {
            Ok((retval, ExitStatus::from_raw(status)))
        }
    }

    pub fn kill(pid: libc::pid_t, signo: libc::c_int) -> Result<(), Error> {
        if unsafe { libc::kill(pid, signo) } == -1 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
