//! Mount probe: answers "is something mounted here?" from the live kernel
//! tables.
//!
//! Two sources are consulted on purpose. Union mounts are looked up in the
//! `mount` listing, filtered by filesystem type. Bind mounts are looked up in
//! the per-process mountinfo table, since the plain listing does not tell a
//! bind mount apart from the filesystem it was taken from. Nothing is cached:
//! every call re-reads kernel state.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::CommandsConfig;
use crate::error::{IoContext, OverlayError, Result};
use crate::logging::LogConfig;
use crate::process::{ProcessRunner, display_argv};

/// Filesystem type reported for union mounts.
pub const UNION_FS_TYPE: &str = "overlay";

/// Combined mount state of an overlay target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountState {
    Inactive,
    ActiveUnion,
    ActiveBind,
    ActiveBoth,
}

impl MountState {
    pub const fn from_flags(union: bool, bind: bool) -> Self {
        match (union, bind) {
            (false, false) => Self::Inactive,
            (true, false) => Self::ActiveUnion,
            (false, true) => Self::ActiveBind,
            (true, true) => Self::ActiveBoth,
        }
    }

    pub const fn union(self) -> bool {
        matches!(self, Self::ActiveUnion | Self::ActiveBoth)
    }

    pub const fn bind(self) -> bool {
        matches!(self, Self::ActiveBind | Self::ActiveBoth)
    }
}

impl std::fmt::Display for MountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Inactive => "inactive",
            Self::ActiveUnion => "active-union",
            Self::ActiveBind => "active-bind",
            Self::ActiveBoth => "active-both",
        })
    }
}

/// One row of the `mount` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Undo the octal escapes (`\040` for space, ...) the kernel applies to
/// paths in mount tables.
pub fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `mount` output: `<source> on <mount point> type <fs type> (<opts>)`.
///
/// Column 2 is the mount point, column 4 the filesystem type. Short lines
/// are skipped.
pub fn parse_mount_listing(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 {
                return None;
            }
            Some(MountEntry {
                mount_point: PathBuf::from(unescape_mount_path(cols[2])),
                fs_type: cols[4].to_owned(),
            })
        })
        .collect()
}

/// Parse a mountinfo table; column 4 is the mount point.
pub fn parse_mountinfo(text: &str) -> Vec<PathBuf> {
    text.lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|raw| PathBuf::from(unescape_mount_path(raw)))
        .collect()
}

pub struct MountProbe {
    runner: Arc<dyn ProcessRunner>,
    mount_program: String,
    mountinfo: PathBuf,
    timeout: Duration,
    log: LogConfig,
}

impl MountProbe {
    pub fn new(runner: Arc<dyn ProcessRunner>, commands: &CommandsConfig, log: LogConfig) -> Self {
        Self {
            runner,
            mount_program: commands.mount.clone(),
            mountinfo: commands.mountinfo.clone(),
            timeout: commands.mount_timeout(),
            log,
        }
    }

    /// Current `mount` listing.
    pub fn mount_listing(&self) -> Result<Vec<MountEntry>> {
        let argv = vec![self.mount_program.clone()];
        let out = self.runner.run(&argv, self.timeout)?;
        if !out.success() {
            return Err(OverlayError::Mount {
                command: display_argv(&argv),
                code: out.status,
                stderr: out.stderr,
            });
        }
        Ok(parse_mount_listing(&out.stdout))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn is_union_mounted(&self, path: &Path) -> Result<bool> {
        let found = self
            .mount_listing()?
            .iter()
            .any(|m| m.fs_type == UNION_FS_TYPE && m.mount_point == path);
        self.log
            .op(format_args!("union mount at {}: {found}", path.display()));
        Ok(found)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub fn is_bind_mounted(&self, path: &Path) -> Result<bool> {
        let table = std::fs::read_to_string(&self.mountinfo).at(&self.mountinfo)?;
        let found = parse_mountinfo(&table).iter().any(|mp| mp == path);
        self.log
            .op(format_args!("bind mount at {}: {found}", path.display()));
        Ok(found)
    }
}
