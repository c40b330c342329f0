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

//! Daemon initialisation: launch-context probes, privilege controls, the
//! pidfile lifecycle, and the detach sequence itself.
//!
//! The centrepiece is [`init`], which converts the calling process into a
//! detached daemon: it ignores `SIGHUP`, forks, starts a new session, forks
//! again so that the process can never reacquire a controlling terminal,
//! moves to the root directory, clears the umask, closes every file
//! descriptor, reopens the standard three on `/dev/null`, and finally
//! acquires a locked pidfile.  A process started by `init(8)` or `inetd(8)`
//! already has no controlling terminal, so the fork dance is skipped (and
//! under inetd, descriptors 0-2 (the service socket) are left open).
//!
//! The pidfile prevents two daemons with the same name from running at
//! once: it is held under an exclusive `fcntl` write lock for the daemon's
//! lifetime, so a stale file left by a crash is recognised (the kernel
//! dropped the dead process's lock) and silently reclaimed.  [`is_running`]
//! and [`stop`] let any other process query and terminate the daemon by
//! name.

use crate::fio;
use crate::limits;
use crate::sys;
use libc::c_int;
use std::env;
use std::ffi::CString;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Error, ErrorKind, Write};
use std::mem;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process;
use std::ptr;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{event, Level};

/// Where pidfiles live for daemons started by root.
const ROOT_PID_DIR: &str = "/var/run";
/// Where pidfiles live for daemons started by ordinary users.
const USER_PID_DIR: &str = "/tmp";
/// Where a daemon parks itself so as not to hamper unmounts.
const ROOT_DIR: &str = "/";

/// Parent exit delay knob, in milliseconds; works around a desktop-session
/// race seen with `exec`-style invocations.
const EXIT_DELAY_VAR: &str = "DAEMON_INIT_EXIT_DELAY_MSEC";

struct Pidfile {
    path: PathBuf,
    // Held open for the lifetime of the daemon: closing it would release
    // the lock.
    #[allow(dead_code)]
    file: File,
}

static PIDFILE: Mutex<Option<Pidfile>> = Mutex::new(None);

/// Returns true if this process was started by `init(8)`.  If it was, we
/// might be getting respawned, so forking and exiting would be a mistake
/// (and unnecessary anyway, since there is no controlling terminal).
pub fn started_by_init() -> bool {
    unsafe { libc::getppid() == 1 }
}

/// Returns true if this process was started by `inetd(8)`, i.e. stdin is a
/// socket.  If it was, the standard descriptors must not be closed and the
/// fork dance is unnecessary.
pub fn started_by_inetd() -> bool {
    let mut opt: c_int = 0;
    let mut len = mem::size_of::<c_int>() as libc::socklen_t;
    unsafe {
        libc::getsockopt(
            0,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut opt as *mut c_int as *mut libc::c_void,
            &mut len,
        ) == 0
    }
}

/// Prevents core files from being generated, so that a daemon holding
/// secrets cannot leak them into a dump.
pub fn prevent_core() -> Result<(), Error> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_CORE, &mut limit) } == -1 {
        return Err(Error::last_os_error());
    }
    limit.rlim_cur = 0;
    if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Revokes setuid and setgid privileges: sets the effective gid/uid back to
/// the real ones and verifies that they no longer differ.  Also closes the
/// passwd and group databases in case they were opened while privileged.
/// Useful when special privileges are only needed at startup (e.g. to bind
/// a privileged socket).
pub fn revoke_privileges() -> Result<(), Error> {
    unsafe {
        let uid = libc::getuid();
        let gid = libc::getgid();

        if libc::getegid() != gid {
            if libc::setgid(gid) == -1 {
                return Err(Error::last_os_error());
            }
            if libc::getegid() != libc::getgid() {
                return Err(Error::from_raw_os_error(libc::EPERM));
            }
        }

        if libc::geteuid() != uid {
            if libc::setuid(uid) == -1 {
                return Err(Error::last_os_error());
            }
            if libc::geteuid() != libc::getuid() {
                return Err(Error::from_raw_os_error(libc::EPERM));
            }
        }

        libc::endpwent();
        libc::endgrent();
    }
    Ok(())
}

/// Changes the owner and group of the process to `uid` and `gid`.  When a
/// `user` name is supplied, the supplementary group list is initialised
/// from the group database; otherwise it is cleared.  Only root can call
/// this.
pub fn become_user(uid: libc::uid_t, gid: libc::gid_t, user: Option<&str>) -> Result<(), Error> {
    unsafe {
        if libc::setgroups(0, ptr::null()) == -1 {
            return Err(Error::last_os_error());
        }

        let cleared = libc::getgroups(0, ptr::null_mut());
        if cleared != 0 {
            // Some systems (FreeBSD) always retain the primary group;
            // tolerate exactly that.
            let mut gids = [0 as libc::gid_t; 10];
            if cleared != 1
                || libc::getgroups(10, gids.as_mut_ptr()) != 1
                || gids[0] != libc::getgid()
            {
                return Err(Error::from_raw_os_error(libc::EPERM));
            }
        }

        if libc::setgid(gid) == -1 {
            return Err(Error::last_os_error());
        }
        if libc::getgid() != gid || libc::getegid() != gid {
            return Err(Error::from_raw_os_error(libc::EPERM));
        }

        if let Some(user) = user {
            let user =
                CString::new(user).map_err(|_| Error::from_raw_os_error(libc::EINVAL))?;
            if libc::initgroups(user.as_ptr(), gid) == -1 {
                return Err(Error::last_os_error());
            }
        }

        if libc::setuid(uid) == -1 {
            return Err(Error::last_os_error());
        }
        if libc::getuid() != uid || libc::geteuid() != uid {
            return Err(Error::from_raw_os_error(libc::EPERM));
        }
    }
    Ok(())
}

/// Builds the pidfile path for `name`: an absolute `name` is used verbatim,
/// anything else becomes `{pid_dir}/{name}.pid` with the directory chosen
/// by real uid.
fn construct_pidfile(name: &str) -> Result<PathBuf, Error> {
    let path = if name.starts_with('/') {
        PathBuf::from(name)
    } else {
        let pid_dir = if unsafe { libc::getuid() } == 0 {
            ROOT_PID_DIR
        } else {
            USER_PID_DIR
        };
        PathBuf::from(pid_dir).join(format!("{name}.pid"))
    };

    if path.as_os_str().len() + 1 > limits::path_max() {
        return Err(Error::from_raw_os_error(libc::ENAMETOOLONG));
    }
    Ok(path)
}

fn locked_elsewhere(err: &Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EACCES) | Some(libc::EAGAIN)
    )
}

/// Opens and write-locks `path`, creating it if necessary.
///
/// The dance matters.  Creation is `O_CREAT|O_EXCL`; if the file already
/// exists it is reopened and the lock attempted on the existing inode.  A
/// dying daemon may unlink the file between our open and our lock, or
/// another starting daemon may unlink and recreate it; both cases are
/// detected (stat `ENOENT`, or device/inode mismatch between descriptor and
/// path) and restart the sequence.  This relies on `fcntl` locks working,
/// which they don't over NFS on some systems, so pidfiles must reside on a
/// local filesystem.
fn lock_pidfile(path: &Path) -> Result<File, Error> {
    loop {
        let file = match File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // The pidfile already exists.  If it's locked, another
                // invocation is still alive; if not, the one that created
                // it has died and we may take over.
                match File::options().read(true).write(true).open(path) {
                    Ok(file) => file,
                    // Removed between our two opens; try again.
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        fio::fcntl_lock(&file, libc::F_SETLK, libc::F_WRLCK, libc::SEEK_SET, 0, 0)?;

        // The file may have been unlinked (and possibly recreated) between
        // the open and the lock.  Holding a lock on a nameless file stops
        // nobody, so verify that the path still names our inode.
        let fd_meta = file.metadata()?;
        let path_meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if fd_meta.dev() != path_meta.dev() || fd_meta.ino() != path_meta.ino() {
            continue;
        }

        fio::fcntl_set_fdflag(&file, libc::FD_CLOEXEC)?;
        return Ok(file);
    }
}

/// Creates and locks the pidfile for `name`, writing this process's id into
/// it.  The presence of the locked file prevents a second daemon with the
/// same name from starting.  Fails with `EINVAL` if this process already
/// holds a pidfile: re-locking the same file from the same process always
/// succeeds under POSIX `fcntl` semantics, so a second acquisition could
/// only ever shadow the first.
///
/// This is called by [`init`], so there is usually no need to call it
/// directly.
pub fn pidfile(name: &str) -> Result<(), Error> {
    let mut state = PIDFILE.lock().unwrap();
    if state.is_some() {
        return Err(Error::from_raw_os_error(libc::EINVAL));
    }

    let path = construct_pidfile(name)?;
    let mut file = lock_pidfile(&path)?;

    let written = file
        .set_len(0)
        .and_then(|()| write!(file, "{}\n", process::id()));
    if let Err(e) = written {
        event!(Level::ERROR, "{}: writing pid failed ({e})", path.display());
        if let Err(err) = fs::remove_file(&path) {
            event!(Level::WARN, "{}: removing pidfile failed ({err})", path.display());
        }
        return Err(e);
    }

    *state = Some(Pidfile { path, file });
    Ok(())
}

/// Unlinks and releases the pidfile, if any.  Best-effort: a failed unlink
/// is logged and swallowed, because this runs while the daemon is exiting.
pub fn close() {
    let mut state = PIDFILE.lock().unwrap();
    if let Some(pidfile) = state.take() {
        if let Err(err) = fs::remove_file(&pidfile.path) {
            event!(
                Level::WARN,
                "{}: removing pidfile failed ({err})",
                pidfile.path.display()
            );
        }
    }
}

/// Returns the process id recorded in the pidfile for `name`.
pub fn getpid(name: &str) -> Result<libc::pid_t, Error> {
    let path = construct_pidfile(name)?;
    let mut line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut line)?;
    line.trim()
        .parse()
        .map_err(|_| Error::from_raw_os_error(libc::EINVAL))
}

/// Returns whether a daemon with the given `name` is running, i.e. whether
/// its pidfile exists and is write-locked by a live process.
pub fn is_running(name: &str) -> Result<bool, Error> {
    let path = construct_pidfile(name)?;
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    match fio::fcntl_lock(&file, libc::F_SETLK, libc::F_RDLCK, libc::SEEK_SET, 0, 0) {
        Ok(()) => Ok(false),
        Err(e) if locked_elsewhere(&e) => Ok(true),
        Err(e) => Err(e),
    }
}

/// Stops the daemon with the given `name` by sending it `SIGTERM`.  If no
/// daemon holds the pidfile, the stale file is removed and the error is
/// `ESRCH`.
pub fn stop(name: &str) -> Result<(), Error> {
    let path = construct_pidfile(name)?;
    match lock_pidfile(&path) {
        Ok(_file) => {
            // We got the lock, so nobody was running.
            if let Err(err) = fs::remove_file(&path) {
                event!(Level::WARN, "{}: removing pidfile failed ({err})", path.display());
            }
            Err(Error::from_raw_os_error(libc::ESRCH))
        }
        Err(e) if locked_elsewhere(&e) => {
            let pid = getpid(name)?;
            if pid <= 0 {
                return Err(Error::from_raw_os_error(libc::EINVAL));
            }
            sys::kill(pid, libc::SIGTERM)
        }
        Err(e) => Err(e),
    }
}

fn exit_delay() -> Option<Duration> {
    let msec: u64 = env::var(EXIT_DELAY_VAR).ok()?.trim().parse().ok()?;
    if msec > 0 {
        Some(Duration::from_millis(msec))
    } else {
        None
    }
}

/// Initialises a daemon:
///
///   - Unless started by `init(8)` or `inetd(8)`: ignores `SIGHUP` (the
///     session leader we are about to abandon may drag a hangup over us
///     first), forks and exits the parent to lose process-group
///     leadership, starts a new session, then forks and exits again so
///     that the process can never acquire a controlling terminal, even
///     under SVR4 semantics.
///
///   - Changes directory to the root so as not to hamper unmounts, and
///     clears the umask so that file modes mean what callers say.
///
///   - Closes every open file descriptor (under inetd, 0-2 are the service
///     socket and stay open) and reopens stdin, stdout, and stderr on
///     `/dev/null`, in case library code expects them to exist.
///
///   - If `name` is given, creates and locks the pidfile via [`pidfile`].
///
/// If the `DAEMON_INIT_EXIT_DELAY_MSEC` environment variable is set to a
/// positive integer, the original parent sleeps that many milliseconds
/// before exiting; some desktop sessions reap `exec`-ed children too
/// eagerly without it.
///
/// # Safety
///
/// Forks: any threads other than the calling thread will be dead in the
/// child, so this must be called while the program is single-threaded.
pub unsafe fn init(name: Option<&str>) -> Result<(), Error> {
    if !(started_by_init() || started_by_inetd()) {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGHUP, &action, ptr::null_mut()) == -1 {
            return Err(Error::last_os_error());
        }

        if sys::fork()?.is_some() {
            if let Some(delay) = exit_delay() {
                thread::sleep(delay);
            }
            process::exit(0);
        }

        // This can only fail if we are already a session leader.
        libc::setsid();

        if sys::fork()?.is_some() {
            process::exit(0);
        }
    }

    env::set_current_dir(ROOT_DIR)?;
    libc::umask(0);

    let inetd = started_by_inetd();
    for fd in 0..limits::open_max() as c_int {
        if inetd && (0..=2).contains(&fd) {
            continue;
        }
        libc::close(fd);
    }

    if !inetd {
        let dev_null: &[u8] = b"/dev/null\0";
        let fd = libc::open(dev_null.as_ptr().cast(), libc::O_RDWR);
        if fd == -1 {
            return Err(Error::last_os_error());
        }
        if fd != 0 {
            if libc::dup2(fd, 0) == -1 {
                return Err(Error::last_os_error());
            }
            libc::close(fd);
        }
        if libc::dup2(0, 1) == -1 {
            return Err(Error::last_os_error());
        }
        if libc::dup2(0, 2) == -1 {
            return Err(Error::last_os_error());
        }
    }

    match name {
        Some(name) => pidfile(name),
        None => Ok(()),
    }
}
