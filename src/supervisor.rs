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

//! A harness that runs a client command as a supervised daemon.
//!
//! The supervisor daemonises itself (via [`daemon::init`]), spawns the
//! client, and waits for it, replaying deferred signals whenever the wait
//! is interrupted:
//!
//!   - `SIGTERM`/`SIGINT` terminate the client and then the supervisor,
//!     which removes its pidfile and dies by the same signal so that its
//!     wait status tells the truth.
//!   - `SIGHUP` restarts the client, the conventional "reload" gesture.
//!   - An optional respawn policy restarts a client that dies from a signal
//!     that indicates an error (such as `SIGSEGV` or `SIGABRT`), throttled
//!     to one restart every ten seconds.
//!
//! An optional configuration file (audited with [`path::is_safe`] before it
//! is read) supplies additional client arguments, one logical line per
//! argument group.  Stdio pumping and pty allocation for the client are out
//! of scope here: the client inherits the daemon's descriptors.

use crate::path::Safety;
use crate::{config, daemon, path, sig, sys};
use anyhow::{bail, Context, Result};
use clap::Parser;
use libc::c_int;
use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{event, Level};

/// Restarts are throttled to no more than one per this interval.
const RESTART_INTERVAL: Duration = Duration::from_secs(10);

static TERM_SIGNAL: AtomicI32 = AtomicI32::new(0);
static RELOAD: AtomicBool = AtomicBool::new(false);

fn on_terminate(signo: c_int) {
    TERM_SIGNAL.store(signo, Ordering::SeqCst);
}

fn on_hangup(_signo: c_int) {
    RELOAD.store(true, Ordering::SeqCst);
}

fn on_child_exit(_signo: c_int) {
    // The wait loop reaps; the arrival alone is what matters.
}

/// Options for supervising a client command as a daemon.
///
/// Designed to be `#[clap(flatten)]`-ed into a host application's argument
/// struct:
///
/// ```no_run
/// use clap::Parser;
/// use std::process::Command;
/// use warden::Supervisor;
///
/// #[derive(Parser, Debug)]
/// struct Args {
///     #[clap(flatten)]
///     supervisor: Supervisor,
///
///     /// Client command and arguments.
///     command: Vec<String>,
/// }
///
/// let Args { supervisor, command } = Args::parse();
/// let mut client = Command::new(&command[0]);
/// client.args(&command[1..]);
/// unsafe { supervisor.run(client) }.unwrap();
/// ```
#[derive(Clone, Debug, Default, Parser, PartialEq, Eq)]
pub struct Supervisor {
    /// Daemon name; also names the pidfile
    #[clap(long)]
    pub name: Option<String>,

    /// Restart the client if it dies from an error signal
    #[clap(long)]
    pub respawn: bool,

    /// Disable core dumps before starting the client
    #[clap(long)]
    pub prevent_core: bool,

    /// Configuration file of extra client arguments (one group per line)
    #[clap(long)]
    pub config: Option<PathBuf>,
}

impl Supervisor {
    pub fn new() -> Supervisor {
        Self::default()
    }

    /// Daemonises and supervises `command` until it exits (or until the
    /// supervisor is told to stop).  Calls [`daemon::init`] exactly once,
    /// before installing signal handlers; on the way out, releases the
    /// pidfile and, if a termination signal was the cause, re-delivers it
    /// so the process dies with the right wait status.
    ///
    /// # Safety
    ///
    /// Daemonising forks; see [`daemon::init`].  Call this while the
    /// program is single-threaded.
    pub unsafe fn run(self, mut command: Command) -> Result<()> {
        if let Some(ref config_path) = self.config {
            match path::is_safe(config_path)
                .with_context(|| format!("could not audit {}", config_path.display()))?
            {
                Safety::Safe => {}
                Safety::Unsafe(reason) => {
                    bail!("{}: unsafe configuration path: {reason}", config_path.display())
                }
            }
            config::parse(config_path, |_, line, _| {
                command.args(line.split_whitespace());
            })
            .with_context(|| format!("could not parse {}", config_path.display()))?;
        }

        if self.prevent_core {
            daemon::prevent_core().context("could not disable core dumps")?;
        }

        daemon::init(self.name.as_deref()).context("could not initialise daemon context")?;

        sig::set_handler(libc::SIGTERM, 0, on_terminate)?;
        sig::set_handler(libc::SIGINT, 0, on_terminate)?;
        sig::set_handler(libc::SIGHUP, 0, on_hangup)?;
        sig::set_handler(libc::SIGCHLD, 0, on_child_exit)?;

        let result = self.supervise(&mut command);
        daemon::close();

        let signo = TERM_SIGNAL.load(Ordering::SeqCst);
        if signo != 0 {
            event!(Level::INFO, "terminating on signal {signo}");
            let _ = signal_hook::low_level::emulate_default_handler(signo);
        }
        result
    }

    fn supervise(&self, command: &mut Command) -> Result<()> {
        let mut next_restart = None;
        let mut crashes = 0;
        loop {
            if TERM_SIGNAL.load(Ordering::SeqCst) != 0 {
                return Ok(());
            }

            let child = command.spawn().context("could not spawn client")?;
            let pid = child.id() as libc::pid_t;
            event!(Level::INFO, "client running as pid {pid}");

            let (status, reload) = wait_for_client(pid)?;

            if TERM_SIGNAL.load(Ordering::SeqCst) != 0 {
                return Ok(());
            }
            if reload {
                event!(Level::INFO, "client pid {pid} stopped for reload ({status})");
                continue;
            }
            if !(self.respawn && should_respawn(status)) {
                event!(Level::INFO, "client pid {pid} exited ({status})");
                return Ok(());
            }

            crashes += 1;
            event!(Level::INFO, "{crashes} crashes: client pid {pid} died ({status})");

            // Throttle restarts.
            let now = Instant::now();
            if let Some(time) = next_restart {
                if now < time {
                    event!(Level::WARN, "waiting until 10 seconds since last restart");
                    sleep(time - now);
                    sig::handle_all();
                }
            }
            next_restart = Some(Instant::now() + RESTART_INTERVAL);
        }
    }
}

/// Waits for the client, replaying deferred signals after every `EINTR`.
/// A termination signal is forwarded to the client; a hangup terminates it
/// and reports that a reload was requested.
fn wait_for_client(pid: libc::pid_t) -> Result<(ExitStatus, bool)> {
    let mut reload = false;
    loop {
        match sys::waitpid(pid, 0) {
            Ok((_, status)) => return Ok((status, reload)),
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                sig::handle_all();
                if TERM_SIGNAL.load(Ordering::SeqCst) != 0 {
                    let _ = sys::kill(pid, libc::SIGTERM);
                } else if RELOAD.swap(false, Ordering::SeqCst) {
                    reload = true;
                    let _ = sys::kill(pid, libc::SIGTERM);
                }
            }
            Err(e) => return Err(e).context("could not wait for client"),
        }
    }
}

/// A client that dies from one of these signals crashed, rather than being
/// shut down, and is eligible for respawning.
fn should_respawn(status: ExitStatus) -> bool {
    match status.signal() {
        Some(signal) => {
            const ERROR_SIGNALS: &[c_int] = &[
                libc::SIGABRT,
                libc::SIGALRM,
                libc::SIGBUS,
                libc::SIGFPE,
                libc::SIGILL,
                libc::SIGPIPE,
                libc::SIGSEGV,
                libc::SIGXCPU,
                libc::SIGXFSZ,
            ];
            ERROR_SIGNALS.contains(&signal)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respawn_policy() {
        // Terminated by an error signal: respawn.
        assert!(should_respawn(ExitStatus::from_raw(libc::SIGSEGV)));
        assert!(should_respawn(ExitStatus::from_raw(libc::SIGABRT)));
        // Ordinary termination or clean exits: don't.
        assert!(!should_respawn(ExitStatus::from_raw(libc::SIGTERM)));
        assert!(!should_respawn(ExitStatus::from_raw(0)));
    }
}
