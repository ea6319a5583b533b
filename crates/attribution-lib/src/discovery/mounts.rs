//! Mount table parsing
//!
//! Reads `/proc/<pid>/mounts` or `/proc/<pid>/mountinfo` style text and
//! yields one `MountEntry` per well-formed line:
//! - mounts: `device mountpoint fstype options dump pass`
//! - mountinfo: `id parent major:minor root mountpoint options [optional...] - fstype source super-options`

use crate::error::{DiscoveryError, ParseError};
use crate::host::HostRoot;
use crate::models::MountEntry;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

const UPPERDIR_OPTION: &str = "upperdir=";
const MOUNTINFO_SEPARATOR: &str = " - ";

/// Default mount table candidates, tried in order
pub const DEFAULT_MOUNT_TABLES: &[&str] = &["/proc/1/mountinfo", "/proc/1/mounts"];

/// Parse mount table text into a lazy sequence of entries
pub fn parse_mount_table(text: &str) -> MountEntries<'_> {
    MountEntries {
        lines: text.lines(),
        skipped: 0,
    }
}

/// Single-pass iterator over parsed mount entries. Malformed lines are
/// skipped and counted, see [`MountEntries::skipped`].
pub struct MountEntries<'a> {
    lines: std::str::Lines<'a>,
    skipped: usize,
}

impl MountEntries<'_> {
    /// Number of malformed lines skipped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for MountEntries<'_> {
    type Item = MountEntry;

    fn next(&mut self) -> Option<MountEntry> {
        for line in self.lines.by_ref() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_mount_line(line) {
                Ok(entry) => return Some(entry),
                Err(e) => {
                    self.skipped += 1;
                    debug!(error = %e, line = %line, "Skipping malformed mount line");
                }
            }
        }
        None
    }
}

/// Parse a single mount table line in either format
pub fn parse_mount_line(line: &str) -> Result<MountEntry, ParseError> {
    if line.contains(MOUNTINFO_SEPARATOR) {
        parse_mountinfo_line(line)
    } else {
        parse_mounts_line(line)
    }
}

fn parse_mounts_line(line: &str) -> Result<MountEntry, ParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(ParseError::MountFieldCount {
            expected: "6",
            found: fields.len(),
        });
    }

    Ok(build_entry(
        fields[0],
        fields[1],
        fields[2],
        split_options(fields[3]),
    ))
}

fn parse_mountinfo_line(line: &str) -> Result<MountEntry, ParseError> {
    let (pre, post) = line
        .split_once(MOUNTINFO_SEPARATOR)
        .ok_or(ParseError::MissingSeparator)?;

    let pre_fields: Vec<&str> = pre.split_whitespace().collect();
    if pre_fields.len() < 6 {
        return Err(ParseError::MountFieldCount {
            expected: "at least 6 before separator",
            found: pre_fields.len(),
        });
    }

    let post_fields: Vec<&str> = post.split_whitespace().collect();
    if post_fields.len() != 3 {
        return Err(ParseError::MountFieldCount {
            expected: "3 after separator",
            found: post_fields.len(),
        });
    }

    // Per-mount options first, filesystem-specific super options after
    let mut options = split_options(pre_fields[5]);
    options.extend(split_options(post_fields[2]));

    Ok(build_entry(
        post_fields[1],
        pre_fields[4],
        post_fields[0],
        options,
    ))
}

fn build_entry(device: &str, mountpoint: &str, fstype: &str, options: Vec<String>) -> MountEntry {
    let device = unescape(device);
    // containerd and the kernel both report overlay mounts with source "overlay"
    let overlay = fstype == "overlay" || device == "overlay";
    let upperdir = if overlay {
        options
            .iter()
            .find_map(|opt| opt.strip_prefix(UPPERDIR_OPTION))
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
    } else {
        None
    };

    MountEntry {
        device,
        mountpoint: PathBuf::from(unescape(mountpoint)),
        fstype: fstype.to_string(),
        options,
        upperdir,
    }
}

fn split_options(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|opt| !opt.is_empty())
        .map(unescape)
        .collect()
}

/// Decode the kernel's octal escapes (`\040` space, `\011` tab, `\012` newline, `\134` backslash)
fn unescape(raw: &str) -> String {
    if !raw.contains('\\') {
        return raw.to_string();
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3
        && digits[0] <= b'3'
        && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

/// Reads the mount table from the first readable candidate file
#[derive(Debug, Clone)]
pub struct MountTableSource {
    candidates: Vec<PathBuf>,
    host: HostRoot,
}

impl MountTableSource {
    pub fn new(candidates: Vec<PathBuf>, host: HostRoot) -> Self {
        Self { candidates, host }
    }

    /// Candidates used when nothing is configured
    pub fn with_defaults(host: HostRoot) -> Self {
        Self::new(
            DEFAULT_MOUNT_TABLES.iter().map(PathBuf::from).collect(),
            host,
        )
    }

    /// Read the mount table text, returning the path it was read from
    pub async fn read(&self) -> Result<(PathBuf, String), DiscoveryError> {
        let mut tried = Vec::with_capacity(self.candidates.len());
        let mut last_error = String::from("no mount table candidates configured");

        for candidate in &self.candidates {
            let path = self.host.resolve(candidate);
            match fs::read_to_string(&path).await {
                Ok(text) => {
                    debug!(path = %path.display(), "Read mount table");
                    return Ok((path, text));
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Mount table candidate unreadable");
                    last_error = e.to_string();
                    tried.push(path);
                }
            }
        }

        Err(DiscoveryError::MountTableUnreadable {
            tried,
            reason: last_error,
        })
    }
}
