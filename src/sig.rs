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

//! Deferred signal dispatch.
//!
//! POSIX severely restricts what a signal handler may do.  Rather than
//! imposing those restrictions on callers, this module installs a tiny
//! async-signal-safe catcher that records each arrival in an atomic counter
//! and returns.  The real handler (an ordinary Rust function with no
//! restrictions on what it may call) runs later, when the main loop calls
//! [`handle`] or [`handle_all`], under a mask that blocks the signal being
//! handled (plus any signals added with [`addset`]).
//!
//! Arrivals between two replays coalesce: however many times a signal was
//! received, its handler runs once and the pending count returns to zero.
//!
//! The catastrophic signals (`SIGILL`, `SIGABRT`, `SIGFPE`, `SIGSEGV`,
//! `SIGBUS`, `SIGSYS`) cannot be deferred, because behaviour after
//! returning from their handlers is undefined.  For those, the user handler
//! runs directly in signal context, with all the async-signal-safety
//! obligations that implies.

use lazy_static::lazy_static;
use libc::c_int;
use std::io::Error;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

/// One more than the highest signal number we track (`_NSIG` on Linux).
const SIG_MAX: usize = 65;

/// A deferred signal handler: an ordinary function, called from the main
/// thread with no async-signal-safety obligations.
pub type Handler = fn(c_int);

/// A siginfo handler, installed directly via `SA_SIGINFO` and therefore
/// called in signal context.
pub type SiginfoHandler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void);

#[derive(Clone, Copy)]
struct Registration {
    mask: libc::sigset_t,
    handler: Handler,
}

lazy_static! {
    static ref TABLE: Mutex<Vec<Option<Registration>>> = Mutex::new(vec![None; SIG_MAX]);
}

// Written only by the replay machinery and the catchers; both arrays are
// readable from signal context.
#[allow(clippy::declare_interior_mutable_const)]
const PENDING_INIT: AtomicU32 = AtomicU32::new(0);
static PENDING: [AtomicU32; SIG_MAX] = [PENDING_INIT; SIG_MAX];
#[allow(clippy::declare_interior_mutable_const)]
const DIRECT_INIT: AtomicUsize = AtomicUsize::new(0);
static DIRECT: [AtomicUsize; SIG_MAX] = [DIRECT_INIT; SIG_MAX];

/// The catcher for deferrable signals.  Async-signal-safe: a single atomic
/// increment and nothing else.
extern "C" fn deferring_catcher(signo: c_int) {
    if let Some(pending) = PENDING.get(signo as usize) {
        pending.fetch_add(1, Ordering::Relaxed);
    }
}

/// The catcher for catastrophic signals: runs the user handler immediately,
/// in signal context.
extern "C" fn direct_catcher(signo: c_int) {
    if let Some(slot) = DIRECT.get(signo as usize) {
        let raw = slot.load(Ordering::Acquire);
        if raw != 0 {
            let handler: Handler = unsafe { mem::transmute(raw) };
            handler(signo);
        }
    }
}

fn is_catastrophic(signo: c_int) -> bool {
    matches!(
        signo,
        libc::SIGILL | libc::SIGABRT | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGSYS
    )
}

fn index(signo: c_int) -> Result<usize, Error> {
    if signo <= 0 || signo as usize >= SIG_MAX {
        Err(Error::from_raw_os_error(libc::EINVAL))
    } else {
        Ok(signo as usize)
    }
}

fn signo_mask(signo: c_int) -> libc::sigset_t {
    unsafe {
        let mut mask = mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, signo);
        mask
    }
}

fn install(signo: c_int, action: &libc::sigaction) -> Result<(), Error> {
    if unsafe { libc::sigaction(signo, action, ptr::null_mut()) } == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Installs `handler` for `signo`.  `flags` is used as the `sa_flags` field
/// of the `sigaction`.  For most signals the function actually installed is
/// the internal catcher, and `handler` only runs when [`handle`] or
/// [`handle_all`] replays the arrival; for the catastrophic signals
/// `handler` runs directly in signal context.  While `handler` runs (either
/// way), `signo` is blocked, along with any signals added via [`addset`].
pub fn set_handler(signo: c_int, flags: c_int, handler: Handler) -> Result<(), Error> {
    let idx = index(signo)?;
    let mask = signo_mask(signo);

    let catcher: extern "C" fn(c_int) = if is_catastrophic(signo) {
        direct_catcher
    } else {
        deferring_catcher
    };

    DIRECT[idx].store(handler as usize, Ordering::Release);
    PENDING[idx].store(0, Ordering::Relaxed);
    TABLE.lock().unwrap()[idx] = Some(Registration { mask, handler });

    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = catcher as usize;
    action.sa_mask = mask;
    action.sa_flags = flags;
    install(signo, &action)
}

/// Installs the three-argument `siginfo_handler` for `signo` directly (no
/// deferral), with `SA_SIGINFO` added to `flags`.  While it runs, `signo`
/// is blocked.
pub fn set_siginfo_handler(
    signo: c_int,
    flags: c_int,
    siginfo_handler: SiginfoHandler,
) -> Result<(), Error> {
    let idx = index(signo)?;
    let mask = signo_mask(signo);

    DIRECT[idx].store(0, Ordering::Release);
    PENDING[idx].store(0, Ordering::Relaxed);
    TABLE.lock().unwrap()[idx] = None;

    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = siginfo_handler as usize;
    action.sa_mask = mask;
    action.sa_flags = flags | libc::SA_SIGINFO;
    install(signo, &action)
}

/// Adds `signo_blocked` to the set of signals blocked while the handler for
/// `signo_handled` runs.  Must be called after
/// [`set_handler`]`(signo_handled, …)`, which initialises that set to
/// contain `signo_handled` itself.
pub fn addset(signo_handled: c_int, signo_blocked: c_int) -> Result<(), Error> {
    let idx = index(signo_handled)?;
    index(signo_blocked)?;

    let mut table = TABLE.lock().unwrap();
    match table[idx] {
        Some(ref mut registration) => {
            if unsafe { libc::sigaddset(&mut registration.mask, signo_blocked) } == -1 {
                Err(Error::last_os_error())
            } else {
                Ok(())
            }
        }
        None => Err(Error::from_raw_os_error(libc::EINVAL)),
    }
}

/// Returns the number of times `signo` has been received (or raised) since
/// the last replay that cleared it.
pub fn received(signo: c_int) -> Result<u32, Error> {
    Ok(PENDING[index(signo)?].load(Ordering::Relaxed))
}

/// Simulates the arrival of `signo` without delivering a real signal.
/// Returns the pending count including this arrival.
pub fn raise(signo: c_int) -> Result<u32, Error> {
    Ok(PENDING[index(signo)?].fetch_add(1, Ordering::Relaxed) + 1)
}

/// Runs the installed handler for `signo` with the registered mask blocked,
/// then clears the pending count and restores the previous mask.  Fails
/// with `EINVAL` if no handler is installed.
pub fn handle(signo: c_int) -> Result<(), Error> {
    let idx = index(signo)?;
    let registration = match TABLE.lock().unwrap()[idx] {
        Some(registration) => registration,
        None => return Err(Error::from_raw_os_error(libc::EINVAL)),
    };

    let mut orig: libc::sigset_t = unsafe { mem::zeroed() };
    if unsafe { libc::sigprocmask(libc::SIG_BLOCK, &registration.mask, &mut orig) } == -1 {
        return Err(Error::last_os_error());
    }

    (registration.handler)(signo);
    PENDING[idx].store(0, Ordering::Relaxed);

    if unsafe { libc::sigprocmask(libc::SIG_SETMASK, &orig, ptr::null_mut()) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Runs the installed handler once for every signal received since the last
/// replay.  Multiple arrivals of the same signal coalesce into a single
/// invocation.  Order across distinct signals is unspecified.
pub fn handle_all() {
    for signo in 1..SIG_MAX as c_int {
        if PENDING[signo as usize].load(Ordering::Relaxed) > 0 {
            let _ = handle(signo);
        }
    }
}
