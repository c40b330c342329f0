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

//! Line-oriented configuration file parsing.
//!
//! The grammar is deliberately small: `#` starts a comment that runs to the
//! end of the line; a backslash as the last non-whitespace character before
//! any comment joins the line with the next one; blank logical lines are
//! ignored.  Callers are expected to audit the file with
//! [`path::is_safe`](crate::path::is_safe) before parsing it.

use crate::fio;
use std::fs::File;
use std::io::{BufReader, Error};
use std::path::Path;

/// Parses the text configuration file named `path`, invoking `parser` once
/// per logical line with the path, the assembled line, and the 1-based
/// number of the physical line on which the logical line started.
///
/// Trailing whitespace is removed from each physical line before joining;
/// leading whitespace is preserved, so the callback sees the split between
/// continued fragments but may need to trim.  I/O errors fail the whole
/// parse.
pub fn parse<P, F>(path: P, mut parser: F) -> Result<(), Error>
where
    P: AsRef<Path>,
    F: FnMut(&Path, &str, usize),
{
    let path = path.as_ref();
    let mut stream = BufReader::new(File::open(path)?);

    let mut logical = String::new();
    let mut start = 0;
    let mut lineno = 0;

    while let Some(physical) = fio::fgetline(&mut stream)? {
        lineno += 1;

        let mut text = physical.as_str();
        if let Some(hash) = text.find('#') {
            text = &text[..hash];
        }

        // Trimming trailing whitespace here is what allows a comment (or
        // nothing at all) after a line-continuation backslash.
        let text = text.trim_end();
        if text.is_empty() {
            continue;
        }

        let (text, continued) = match text.strip_suffix('\\') {
            Some(text) => (text, true),
            None => (text, false),
        };

        if logical.is_empty() {
            start = lineno;
        }
        logical.push_str(text);

        if continued {
            continue;
        }

        parser(path, &logical, start);
        logical.clear();
    }

    Ok(())
}
