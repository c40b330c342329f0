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

//! Process-level tests: these spawn the `test-daemon` example, which
//! detaches itself with `daemon::init`, and then observe it from the
//! outside through its pidfile.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::Mutex;
use warden::daemon;

fn remove_if_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e)?,
    }
}

enum Completion<T> {
    Incomplete,
    Complete(T),
}
use Completion::*;

/// Repeatedly evaluates `condition`, sleeping a bit between calls, until it
/// yields Complete(value), then returns Ok(value).  After a while, however,
/// give up and return an error instead.
fn wait_until<T, F>(mut condition: F) -> Result<T>
where
    F: FnMut() -> Completion<T>,
{
    for i in 0..10 {
        if let Complete(result) = condition() {
            return Ok(result);
        }
        let ms = match i {
            0 => 10,
            1 => 100,
            _ => 1000,
        };
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
    Err(anyhow!("wait_until timed out"))
}

fn test_daemon_command() -> Result<Command> {
    let examples_dir = std::env::current_dir()?.join("target/debug/examples");
    Ok(Command::new(examples_dir.join("test-daemon")))
}

fn unique_filename(extension: &str) -> Result<PathBuf> {
    static COUNTER: Mutex<usize> = Mutex::new(0);
    let count = match *COUNTER.lock().unwrap() {
        ref mut counter => {
            *counter += 1;
            *counter
        }
    };

    let pid = std::process::id();
    let name = std::env::current_dir()?.join(format!("test{pid}.{count}.{extension}"));
    remove_if_exists(&name)?;
    Ok(name)
}

fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> Result<(), std::io::Error> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        Err(std::io::Error::last_os_error())?
    } else {
        Ok(())
    }
}

fn process_exists(pid: libc::pid_t) -> Result<(), std::io::Error> {
    send_signal(pid, 0)
}

fn read_pidfile<P>(path: P) -> Result<libc::pid_t>
where
    P: AsRef<Path>,
{
    let pidfile_string = String::from_utf8(std::fs::read(path)?)?;
    Ok(pidfile_string.trim().parse()?)
}

/// Returns the parent pid of `pid`, from `/proc/{pid}/stat` (the field
/// after the parenthesised command name).
fn parent_pid(pid: libc::pid_t) -> Result<libc::pid_t> {
    let stat = String::from_utf8(std::fs::read(format!("/proc/{pid}/stat"))?)?;
    let after_comm = stat
        .rsplit_once(')')
        .ok_or_else(|| anyhow!("malformed stat line {stat:?}"))?
        .1;
    let ppid = after_comm
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed stat line {stat:?}"))?;
    Ok(ppid.parse().with_context(|| format!("parsing ppid {ppid:?}"))?)
}

fn wait_for_process_to_die(pid: libc::pid_t) -> Result<()> {
    wait_until(|| match process_exists(pid) {
        Ok(()) => Incomplete,
        Err(_) => Complete(()),
    })
}

fn wait_until_file_exists<P>(path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    wait_until(|| match path.as_ref().exists() {
        true => Complete(()),
        false => Incomplete,
    })?;
    Ok(())
}

fn wait_until_file_is_gone<P>(path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    wait_until(|| match path.as_ref().exists() {
        false => Complete(()),
        true => Incomplete,
    })?;
    Ok(())
}

/// Waits for `child` to die, and returns:
///    - `Ok(Ok(status))`: Child exited with `status`.
///    - `Ok(Err(e))`: System reported error waiting for `child`.
///    - `Err(e)`: Timeout.
fn wait_for_child_to_die(child: &mut Child) -> Result<Result<ExitStatus>> {
    match wait_until(|| match child.try_wait() {
        Ok(Some(status)) => Complete(Ok(status)),
        Ok(None) => Incomplete,
        Err(e) => Complete(Err(e)),
    }) {
        Ok(Ok(result)) => Ok(Ok(result)),
        Ok(Err(error)) => Ok(Err(error.into())),
        Err(error) => Err(error),
    }
}

fn check_file_does_not_exist<P>(path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    match std::fs::File::open(path.as_ref()) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => Err(anyhow!(
            "{}: expected NotFound, got {other:?}",
            path.as_ref().display()
        ))?,
    }
}

/// Spawns a detached test daemon and returns its pidfile path, greeting
/// path, and pid, once it is fully up.
fn start_daemon() -> Result<(PathBuf, PathBuf, libc::pid_t)> {
    let pidfile_name = unique_filename("pid")?;
    let greeting_name = unique_filename("txt")?;
    let mut child = test_daemon_command()?
        .arg("--name")
        .arg(&pidfile_name)
        .arg("--greeting-file")
        .arg(&greeting_name)
        .spawn()?;

    // The spawned process detaches and exits; the daemon proper is its
    // grandchild.  The greeting file only appears once the daemon is past
    // initialisation, with the pidfile written and locked.
    wait_for_child_to_die(&mut child)??;
    wait_until_file_exists(&pidfile_name)?;
    wait_until_file_exists(&greeting_name)?;

    let daemon_pid = read_pidfile(&pidfile_name)?;
    process_exists(daemon_pid)?;
    assert_ne!(daemon_pid, child.id() as libc::pid_t);
    Ok((pidfile_name, greeting_name, daemon_pid))
}

#[test]
fn test_pidfile_and_signal() -> Result<()> {
    let (pidfile_name, greeting_name, daemon_pid) = start_daemon()?;

    let name = pidfile_name.to_str().unwrap();
    assert!(daemon::is_running(name)?);
    assert_eq!(daemon::getpid(name)?, daemon_pid);

    // Kill the daemon and verify that it removes its own pidfile.
    send_signal(daemon_pid, libc::SIGTERM)?;
    wait_for_process_to_die(daemon_pid)?;
    wait_until_file_is_gone(&pidfile_name)?;
    assert!(!daemon::is_running(name)?);

    remove_if_exists(&greeting_name)?;
    Ok(())
}

#[test]
fn test_stop_by_name() -> Result<()> {
    let (pidfile_name, greeting_name, daemon_pid) = start_daemon()?;

    // Stop it through the pidfile, the way an administrator would.
    daemon::stop(pidfile_name.to_str().unwrap())?;
    wait_for_process_to_die(daemon_pid)?;
    wait_until_file_is_gone(&pidfile_name)?;

    remove_if_exists(&greeting_name)?;
    Ok(())
}

#[test]
fn test_detached_from_caller() -> Result<()> {
    let (pidfile_name, greeting_name, daemon_pid) = start_daemon()?;

    // The daemon was reparented by the double fork: whoever its parent is
    // now, it is not this process.
    assert_ne!(parent_pid(daemon_pid)?, std::process::id() as libc::pid_t);

    send_signal(daemon_pid, libc::SIGTERM)?;
    wait_for_process_to_die(daemon_pid)?;
    wait_until_file_is_gone(&pidfile_name)?;

    remove_if_exists(&greeting_name)?;
    Ok(())
}

#[test]
fn test_second_instance_is_refused() -> Result<()> {
    let (pidfile_name, greeting_name, daemon_pid) = start_daemon()?;

    // A second daemon with the same name must fail to initialise: the
    // pidfile lock is held.  Its greeting file must never appear.
    let greeting2 = unique_filename("txt")?;
    let mut child = test_daemon_command()?
        .arg("--name")
        .arg(&pidfile_name)
        .arg("--greeting-file")
        .arg(&greeting2)
        .spawn()?;
    wait_for_child_to_die(&mut child)??;
    std::thread::sleep(std::time::Duration::from_millis(500));
    check_file_does_not_exist(&greeting2)?;

    // The first daemon is unharmed.
    assert_eq!(read_pidfile(&pidfile_name)?, daemon_pid);
    assert!(daemon::is_running(pidfile_name.to_str().unwrap())?);

    send_signal(daemon_pid, libc::SIGTERM)?;
    wait_for_process_to_die(daemon_pid)?;
    wait_until_file_is_gone(&pidfile_name)?;

    remove_if_exists(&greeting_name)?;
    Ok(())
}

fn supervise_command() -> Result<Command> {
    let examples_dir = std::env::current_dir()?.join("target/debug/examples");
    Ok(Command::new(examples_dir.join("supervise")))
}

#[test]
fn test_supervisor_stops_by_name() -> Result<()> {
    // Supervise a long-running client; the supervisor daemonises itself and
    // advertises through its own pidfile.
    let pidfile_name = unique_filename("pid")?;
    let mut child = supervise_command()?
        .arg("--name")
        .arg(&pidfile_name)
        .arg("sleep")
        .arg("300")
        .spawn()?;
    wait_for_child_to_die(&mut child)??;
    wait_until_file_exists(&pidfile_name)?;

    let name = pidfile_name.to_str().unwrap();
    wait_until(|| match daemon::is_running(name) {
        Ok(true) => Complete(()),
        _ => Incomplete,
    })?;
    let supervisor_pid = read_pidfile(&pidfile_name)?;

    // Stopping the supervisor terminates the client and removes the
    // pidfile.
    daemon::stop(name)?;
    wait_for_process_to_die(supervisor_pid)?;
    wait_until_file_is_gone(&pidfile_name)?;
    Ok(())
}

#[test]
fn test_startup_failure_leaves_nothing_behind() -> Result<()> {
    let pidfile_name = "/nonexistent-warden-dir/test.pid";
    let greeting_name = unique_filename("txt")?;
    let mut child = test_daemon_command()?
        .arg("--name")
        .arg(pidfile_name)
        .arg("--greeting-file")
        .arg(&greeting_name)
        .spawn()?;

    // The detach happens before the pidfile, so the spawned process itself
    // exits successfully either way; the daemon dies during initialisation
    // and must leave no trace.
    wait_for_child_to_die(&mut child)??;
    std::thread::sleep(std::time::Duration::from_millis(500));
    check_file_does_not_exist(pidfile_name)?;
    check_file_does_not_exist(&greeting_name)?;
    Ok(())
}
