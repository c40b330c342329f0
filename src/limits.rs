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

//! Runtime resource limits with sane fallbacks.
//!
//! These queries are advisory: when the system reports the limit as
//! indeterminate (or the query fails), a usable default is returned instead
//! of an error.

/// Fallback used when a limit is indeterminate.
const FALLBACK: usize = 1024;

/// Returns the maximum length of a path on the root filesystem
/// (`pathconf(_PC_PATH_MAX)`), or 1024 if indeterminate.
pub fn path_max() -> usize {
    let root: &[u8] = b"/\0";
    let limit = unsafe { libc::pathconf(root.as_ptr().cast(), libc::_PC_PATH_MAX) };
    if limit <= 0 {
        FALLBACK
    } else {
        limit as usize
    }
}

/// Returns the maximum number of open file descriptors
/// (`sysconf(_SC_OPEN_MAX)`), or 1024 if indeterminate.
pub fn open_max() -> usize {
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit <= 0 {
        FALLBACK
    } else {
        limit as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_usable() {
        assert!(path_max() >= 256);
        assert!(open_max() >= 256);
    }
}
