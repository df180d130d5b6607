// Copyright 2022 Google LLC
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

//! Command-line tokenizing and joining for spawned domains: splits a
//! single command-line string into an argv vector, honoring
//! double-quoted spans that may themselves contain whitespace, and joins
//! an argv vector back into one string. The two are inverses of each
//! other for any argv that doesn't itself need quoting.
//!
//! Unlike the simplest possible whitespace/quote split, a backslash
//! before a `"` or another `\` is treated as an escape so an argument can
//! carry a literal quote -- without that, there would be no way to name
//! an argument containing one.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;

pub const MAX_CMDLINE_ARGS: usize = 64;

/// Splits `cmdline` into an argv vector. Whitespace separates arguments
/// except inside a `"..."` span; a `\"` or `\\` anywhere is an escaped
/// literal character rather than a span delimiter.
pub fn make_argv(cmdline: &str) -> Vec<String> {
    let chars: Vec<char> = cmdline.chars().collect();
    let len = chars.len();
    let mut argv = Vec::new();
    let mut i = 0;
    while i < len && argv.len() < MAX_CMDLINE_ARGS {
        while i < len && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= len {
            break;
        }
        let mut arg = String::new();
        if chars[i] == '"' {
            i += 1;
            while i < len && chars[i] != '"' {
                if chars[i] == '\\' && i + 1 < len && (chars[i + 1] == '"' || chars[i + 1] == '\\') {
                    arg.push(chars[i + 1]);
                    i += 2;
                } else {
                    arg.push(chars[i]);
                    i += 1;
                }
            }
            if i < len {
                i += 1; // consume the closing quote
            }
        } else {
            while i < len && !chars[i].is_whitespace() {
                if chars[i] == '\\' && i + 1 < len && (chars[i + 1] == '"' || chars[i + 1] == '\\') {
                    arg.push(chars[i + 1]);
                    i += 2;
                } else {
                    arg.push(chars[i]);
                    i += 1;
                }
            }
        }
        argv.push(arg);
    }
    argv
}

/// Joins `argv` into a single command-line string, the inverse of
/// `make_argv`. Any argument containing whitespace or a `"` is wrapped in
/// quotes, with embedded `"` and `\` escaped.
pub fn make_cmdline(argv: &[impl AsRef<str>]) -> String {
    let mut out = String::new();
    for (i, arg) in argv.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let arg = arg.as_ref();
        let needs_quoting = arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"');
        if needs_quoting {
            out.push('"');
            for c in arg.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        } else {
            out.push_str(arg);
        }
    }
    out
}
