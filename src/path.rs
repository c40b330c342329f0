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

//! Path canonicalisation and safety auditing.
//!
//! A daemon that reads a configuration or command file as a privileged user
//! must not trust the path if any directory along it is writable by someone
//! other than its owner: that someone could replace a component and feed the
//! daemon their own file.  [`is_safe`] walks the path from file to root,
//! follows symbolic links explicitly (an `lstat` walk alone would miss
//! them), and reports the first group- or world-writable component.

use std::env;
use std::fs;
use std::io::Error;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

/// Symlink chains deeper than this fail with `ELOOP`.
const MAX_SYMLINK_DEPTH: u32 = 16;

/// The verdict of a path audit: either the path can be trusted, or it can't,
/// with a one-line reason naming the offending component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Safety {
    Safe,
    Unsafe(String),
}

impl Safety {
    pub fn is_safe(&self) -> bool {
        *self == Safety::Safe
    }
}

/// Converts `path` into an absolute path, collapsing `//`, `/./`, `/../`,
/// and any trailing `/`.  The result looks canonical but isn't: symbolic
/// links are not followed or expanded.  Pure apart from the working
/// directory lookup needed for relative paths.
pub fn absolute<P: AsRef<Path>>(path: P) -> Result<PathBuf, Error> {
    let path = path.as_ref();
    let full;
    let path = if path.is_absolute() {
        path
    } else {
        full = env::current_dir()?.join(path);
        &full
    };

    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            // The root's parent is the root.
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
            Component::Prefix(_) => unreachable!("no path prefixes on unix"),
        }
    }
    Ok(out)
}

/// Checks that the file referred to by `path`, and every directory leading
/// to it, is writable only by its owner, following symbolic links.  Returns
/// `Safety::Unsafe` with an explanation such as `"/tmp is group and world
/// writable"` when some component fails the test, and an error carrying
/// `ELOOP` when a symlink chain exceeds 16 levels.
pub fn is_safe<P: AsRef<Path>>(path: P) -> Result<Safety, Error> {
    check(&absolute(path)?, 0)
}

fn check(path: &Path, depth: u32) -> Result<Safety, Error> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(Error::from_raw_os_error(libc::ELOOP));
    }

    for prefix in path.ancestors() {
        let meta = fs::symlink_metadata(prefix)?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(prefix)?;
            // A relative target is resolved against the link's parent,
            // i.e. <link>/../<target>.
            let resolved = absolute(prefix.join("..").join(&target))?;
            match check(&resolved, depth + 1)? {
                Safety::Safe => {}
                verdict => return Ok(verdict),
            }
        } else {
            let group = meta.mode() & libc::S_IWGRP as u32 != 0;
            let world = meta.mode() & libc::S_IWOTH as u32 != 0;
            if group || world {
                let which = match (group, world) {
                    (true, true) => "group and world",
                    (true, false) => "group",
                    _ => "world",
                };
                return Ok(Safety::Unsafe(format!(
                    "{} is {} writable",
                    prefix.display(),
                    which
                )));
            }
        }
    }

    Ok(Safety::Safe)
}
