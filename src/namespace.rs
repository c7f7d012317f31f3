/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Store namespace layout and task-key derivation.
//!
//! Every log file maps to exactly one child of the namespace base path. The
//! mapping percent-encodes the log path so that arbitrary filesystem paths
//! become flat child names, and decodes back to the original path when the
//! finisher needs it. Rescan markers live under the same base with a
//! reserved name prefix and carry no log path.
//!
//! ## Layout
//!
//! ```text
//! <base>                      container for split tasks
//! <base>/<encoded log path>   one task per log file
//! <base>/rescan-<sequence>    ephemeral sequential rescan markers
//! ```

/// Child-name prefix reserved for rescan markers.
const RESCAN_PREFIX: &str = "rescan-";

/// The namespace within the coordination store that holds split tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    base: String,
}

impl Namespace {
    /// Creates a namespace rooted at `base`. A trailing slash is stripped so
    /// that child paths join cleanly.
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.len() > 1 && base.ends_with('/') {
            base.pop();
        }
        Self { base }
    }

    /// The base path of the namespace.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Joins a child name onto the base path.
    pub fn child(&self, name: &str) -> String {
        format!("{}/{}", self.base, name)
    }

    /// Derives the task key for a log file path.
    ///
    /// Two distinct log paths always produce two distinct keys; the
    /// encoding is reversible through [`Namespace::log_path`].
    pub fn task_key(&self, log_path: &str) -> String {
        self.child(&encode(log_path))
    }

    /// Recovers the log file path from a task key or bare child name.
    ///
    /// Returns `None` for rescan markers, for keys outside this namespace,
    /// and for malformed escape sequences.
    pub fn log_path(&self, task_key: &str) -> Option<String> {
        let name = self.child_name(task_key)?;
        if name.starts_with(RESCAN_PREFIX) {
            return None;
        }
        decode(name)
    }

    /// Whether a full path names a rescan marker in this namespace.
    pub fn is_rescan(&self, path: &str) -> bool {
        self.child_name(path)
            .map(|name| name.starts_with(RESCAN_PREFIX))
            .unwrap_or(false)
    }

    /// Whether a bare child name (as returned by a children listing) is a
    /// rescan marker.
    pub fn is_rescan_child(&self, name: &str) -> bool {
        name.starts_with(RESCAN_PREFIX)
    }

    /// The path prefix that sequential rescan markers are created under.
    pub fn rescan_prefix(&self) -> String {
        self.child(RESCAN_PREFIX)
    }

    /// Strips the base from a full path, or passes a bare child name
    /// through. Returns `None` if the path lies outside this namespace.
    fn child_name<'a>(&self, path: &'a str) -> Option<&'a str> {
        match path.strip_prefix(&self.base) {
            Some(rest) => rest.strip_prefix('/'),
            None if !path.contains('/') => Some(path),
            None => None,
        }
    }
}

/// Percent-encodes a log path into a flat child name. Every byte outside
/// `[A-Za-z0-9._-]` is written as `%XX`.
fn encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{:02X}", other));
            }
        }
    }
    out
}

/// Inverse of [`encode`]. Returns `None` on truncated or non-hex escapes
/// and on byte sequences that are not valid UTF-8.
fn decode(name: &str) -> Option<String> {
    let mut out = Vec::with_capacity(name.len());
    let mut bytes = name.bytes();
    while let Some(byte) = bytes.next() {
        if byte == b'%' {
            let hi = hex_value(bytes.next()?)?;
            let lo = hex_value(bytes.next()?)?;
            out.push(hi << 4 | lo);
        } else {
            out.push(byte);
        }
    }
    String::from_utf8(out).ok()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}
