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

//! File I/O primitives: advisory locks, descriptor flag toggles, a line
//! reader for all three newline conventions, and a fifo opener that
//! guarantees a unique reader.

use libc::{c_int, mode_t, off_t};
use std::ffi::CString;
use std::fs;
use std::io::{BufRead, Error, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

/// Thin wrapper around `fcntl(2)` record locking.  `cmd` is `F_SETLK` or
/// `F_SETLKW`; `kind` is `F_RDLCK`, `F_WRLCK`, or `F_UNLCK`; `whence`,
/// `start`, and `len` describe the byte range (`SEEK_SET, 0, 0` covers the
/// whole file).  A non-blocking attempt on a file locked by another process
/// fails with `EACCES` or `EAGAIN`, depending on the platform; callers
/// should treat both as "locked elsewhere".
pub fn fcntl_lock<F: AsRawFd>(
    fd: &F,
    cmd: c_int,
    kind: c_int,
    whence: c_int,
    start: off_t,
    len: off_t,
) -> Result<(), Error> {
    let mut lck = libc::flock {
        l_type: kind as i16,
        l_whence: whence as i16,
        l_start: start,
        l_len: len,
        l_pid: 0,
    };

    loop {
        let retval = unsafe { libc::fcntl(fd.as_raw_fd(), cmd, &mut lck as *mut libc::flock) };
        if retval != -1 {
            return Ok(());
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn fcntl_get(fd: c_int, cmd: c_int) -> Result<c_int, Error> {
    let flags = unsafe { libc::fcntl(fd, cmd) };
    if flags == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(flags)
    }
}

fn fcntl_set(fd: c_int, cmd: c_int, flags: c_int) -> Result<(), Error> {
    if unsafe { libc::fcntl(fd, cmd, flags) } == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Sets `flag` in the descriptor flags of `fd` (`F_GETFD`/`F_SETFD`, e.g.
/// `FD_CLOEXEC`).
pub fn fcntl_set_fdflag<F: AsRawFd>(fd: &F, flag: c_int) -> Result<(), Error> {
    let flags = fcntl_get(fd.as_raw_fd(), libc::F_GETFD)?;
    fcntl_set(fd.as_raw_fd(), libc::F_SETFD, flags | flag)
}

/// Clears `flag` from the descriptor flags of `fd`.
pub fn fcntl_clear_fdflag<F: AsRawFd>(fd: &F, flag: c_int) -> Result<(), Error> {
    let flags = fcntl_get(fd.as_raw_fd(), libc::F_GETFD)?;
    fcntl_set(fd.as_raw_fd(), libc::F_SETFD, flags & !flag)
}

/// Sets or clears `O_NONBLOCK` on the file status flags of `fd`.
pub fn nonblock_set<F: AsRawFd>(fd: &F, on: bool) -> Result<(), Error> {
    let flags = fcntl_get(fd.as_raw_fd(), libc::F_GETFL)?;
    let flags = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    fcntl_set(fd.as_raw_fd(), libc::F_SETFL, flags)
}

/// Puts `fd` into non-blocking mode.
pub fn nonblock_on<F: AsRawFd>(fd: &F) -> Result<(), Error> {
    nonblock_set(fd, true)
}

/// Puts `fd` into blocking mode.
pub fn nonblock_off<F: AsRawFd>(fd: &F) -> Result<(), Error> {
    nonblock_set(fd, false)
}

/// Reads one line from `stream`, accepting Unix (`"\n"`), DOS (`"\r\n"`),
/// and old Macintosh (`"\r"`) line endings, even mixed within one stream.
/// Whichever terminator ends the line is stored as a single `'\n'`.  A final
/// line without a terminator is returned without one.  Lines may be of
/// arbitrary length.  Returns `Ok(None)` when the end of file occurs before
/// any byte is read.  Calls to this function can be mixed with other reads
/// on the same stream.
pub fn fgetline<R: BufRead + ?Sized>(stream: &mut R) -> Result<Option<String>, Error> {
    let mut line = Vec::new();

    loop {
        let (terminator, used) = {
            let buf = stream.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            match buf.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(at) => {
                    line.extend_from_slice(&buf[..at]);
                    (Some(buf[at]), at + 1)
                }
                None => {
                    line.extend_from_slice(buf);
                    (None, buf.len())
                }
            }
        };
        stream.consume(used);

        if let Some(terminator) = terminator {
            if terminator == b'\r' {
                // Swallow the '\n' of a "\r\n" pair.
                let buf = stream.fill_buf()?;
                if buf.first() == Some(&b'\n') {
                    stream.consume(1);
                }
            }
            line.push(b'\n');
            break;
        }
    }

    if line.is_empty() {
        return Ok(None);
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|e| Error::new(ErrorKind::InvalidData, e))
}

fn cpath(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::from_raw_os_error(libc::EINVAL))
}

/// Returns whether `path` exists and is a fifo.  If it exists but is not a
/// fifo and `prepare` is true, it is unlinked so that a fifo can be created
/// in its place.
pub fn fifo_exists<P: AsRef<Path>>(path: P, prepare: bool) -> Result<bool, Error> {
    let path = path.as_ref();
    match fs::metadata(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
        Ok(meta) => {
            if !meta.file_type().is_fifo() {
                if prepare {
                    let _ = fs::remove_file(path);
                }
                Ok(false)
            } else {
                Ok(true)
            }
        }
    }
}

/// Returns whether `path` refers to a fifo that some process already has
/// open for reading.  The probe is a non-blocking write-only open: with no
/// reader it fails with `ENXIO`.  If `path` is a non-fifo and `prepare` is
/// true, it is unlinked.
pub fn fifo_has_reader<P: AsRef<Path>>(path: P, prepare: bool) -> Result<bool, Error> {
    let path = path.as_ref();
    if !fifo_exists(path, prepare)? {
        return Ok(false);
    }

    let c = cpath(path)?;
    let fd = unsafe { libc::open(c.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
    if fd == -1 {
        let err = Error::last_os_error();
        return if err.raw_os_error() == Some(libc::ENXIO) {
            Ok(false)
        } else {
            Err(err)
        };
    }
    drop(unsafe { OwnedFd::from_raw_fd(fd) });
    Ok(true)
}

/// Creates (or reuses) the fifo named `path` with creation mode `mode` and
/// opens it for reading, guaranteeing that at most one process reads it.  If
/// another process already has the fifo open for reading, fails with
/// `EADDRINUSE`.
///
/// On success, returns the read descriptor (in blocking mode) and a write
/// descriptor.  The write descriptor only exists to ensure that there is
/// always at least one writer, so that a `read(2)` on the read descriptor
/// blocks until another process writes rather than returning end-of-file.
/// (Opening the fifo read-write would achieve the same on many systems but
/// is undefined by POSIX.)
///
/// If `lock` is true, an exclusive lock is taken on the write descriptor so
/// that two processes cannot decide "no reader" at the same time; a
/// conflicting lock maps to `EADDRINUSE`.  Some systems cannot lock fifos
/// (`EOPNOTSUPP`/`ENOTSUP`/`EBADF`); there the fifo is opened anyway and the
/// uniqueness guarantee rests on the reader probe alone.
///
/// On failure the fifo is unlinked iff this call created it.
pub fn fifo_open<P: AsRef<Path>>(
    path: P,
    mode: mode_t,
    lock: bool,
) -> Result<(OwnedFd, OwnedFd), Error> {
    let path = path.as_ref();

    if fifo_has_reader(path, true)? {
        return Err(Error::from_raw_os_error(libc::EADDRINUSE));
    }

    let c = cpath(path)?;
    let mine = if unsafe { libc::mkfifo(c.as_ptr(), mode) } != -1 {
        true
    } else {
        let err = Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
        false
    };

    let result = (|| {
        // Non-blocking, so that we don't wait for a writer: we are about to
        // supply our own.
        let rfd = unsafe { libc::open(c.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
        if rfd == -1 {
            return Err(Error::last_os_error());
        }
        let rfd = unsafe { OwnedFd::from_raw_fd(rfd) };

        // Someone may have replaced the fifo with something else between the
        // reader probe and the open.
        if !fd_is_fifo(&rfd)? {
            return Err(Error::from_raw_os_error(libc::EINVAL));
        }

        let wfd = unsafe { libc::open(c.as_ptr(), libc::O_WRONLY) };
        if wfd == -1 {
            return Err(Error::last_os_error());
        }
        let wfd = unsafe { OwnedFd::from_raw_fd(wfd) };

        if lock {
            if let Err(err) = fcntl_lock(&wfd, libc::F_SETLK, libc::F_WRLCK, libc::SEEK_SET, 0, 0) {
                match err.raw_os_error() {
                    // This OS can't lock fifos.
                    Some(libc::EOPNOTSUPP) | Some(libc::EBADF) => {}
                    Some(libc::EACCES) | Some(libc::EAGAIN) => {
                        return Err(Error::from_raw_os_error(libc::EADDRINUSE))
                    }
                    _ => return Err(err),
                }
            }
        }

        if !fd_is_fifo(&wfd)? {
            return Err(Error::from_raw_os_error(libc::EINVAL));
        }

        nonblock_off(&rfd)?;

        Ok((rfd, wfd))
    })();

    if result.is_err() && mine {
        let _ = fs::remove_file(path);
    }
    result
}

fn fd_is_fifo<F: AsRawFd>(fd: &F) -> Result<bool, Error> {
    let mut status: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut status) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(status.st_mode & libc::S_IFMT == libc::S_IFIFO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};
    use std::fs::File;

    #[test]
    fn fgetline_normalises_line_endings() {
        let mut stream = Cursor::new(&b"one\ntwo\r\nthree\rfour"[..]);
        assert_eq!(fgetline(&mut stream).unwrap().as_deref(), Some("one\n"));
        assert_eq!(fgetline(&mut stream).unwrap().as_deref(), Some("two\n"));
        assert_eq!(fgetline(&mut stream).unwrap().as_deref(), Some("three\n"));
        assert_eq!(fgetline(&mut stream).unwrap().as_deref(), Some("four"));
        assert_eq!(fgetline(&mut stream).unwrap(), None);
    }

    #[test]
    fn fgetline_handles_bare_carriage_returns() {
        let mut stream = Cursor::new(&b"a\r\rb\r"[..]);
        assert_eq!(fgetline(&mut stream).unwrap().as_deref(), Some("a\n"));
        assert_eq!(fgetline(&mut stream).unwrap().as_deref(), Some("\n"));
        assert_eq!(fgetline(&mut stream).unwrap().as_deref(), Some("b\n"));
        assert_eq!(fgetline(&mut stream).unwrap(), None);
    }

    #[test]
    fn fgetline_empty_stream() {
        let mut stream = Cursor::new(&b""[..]);
        assert_eq!(fgetline(&mut stream).unwrap(), None);
    }

    #[test]
    fn fcntl_lock_and_unlock() {
        let path = std::env::temp_dir().join(format!("fio-lock-test-{}", std::process::id()));
        let file = File::create(&path).unwrap();
        fcntl_lock(&file, libc::F_SETLK, libc::F_WRLCK, libc::SEEK_SET, 0, 0).unwrap();
        fcntl_lock(&file, libc::F_SETLK, libc::F_UNLCK, libc::SEEK_SET, 0, 0).unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn fifo_open_unique_reader() {
        let path = std::env::temp_dir().join(format!("fio-fifo-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let (rfd, wfd) = fifo_open(&path, 0o600, true).unwrap();
        assert!(fifo_exists(&path, false).unwrap());
        assert!(fifo_has_reader(&path, false).unwrap());

        // A second open must see the existing reader.
        let err = fifo_open(&path, 0o600, true).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));

        // Data written to the write side arrives on the (blocking) read side.
        let mut writer = File::from(wfd);
        writer.write_all(b"ping\n").unwrap();
        let mut reader = File::from(rfd);
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping\n");

        std::fs::remove_file(&path).unwrap();
    }
}
