use std::fs;
use std::path::Path;

use crate::error::{IoContext, Result};
use crate::logging::LogConfig;

/// Create `path` and its parents, tolerating an existing directory.
pub fn ensure_dir(path: &Path, log: LogConfig) -> Result<()> {
    if path.is_dir() {
        log.op(format_args!("dir exists: {}", path.display()));
        return Ok(());
    }
    log.op(format_args!("mkdir: {}", path.display()));
    fs::create_dir_all(path).at(path)
}

/// Create `link -> target` unless something already sits at `link`.
pub fn symlink_if_missing(target: &Path, link: &Path, log: LogConfig) -> Result<()> {
    if fs::symlink_metadata(link).is_ok() {
        log.op(format_args!("symlink exists: {}", link.display()));
        return Ok(());
    }
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    log.op(format_args!(
        "symlink: {} -> {}",
        link.display(),
        target.display()
    ));
    std::os::unix::fs::symlink(target, link).at(link)
}

/// Copy a regular file, creating the destination's parents.
pub fn copy_file(source: &Path, target: &Path, log: LogConfig) -> Result<u64> {
    if target.exists() {
        log.op(format_args!(
            "overwrite: {} -> {}",
            source.display(),
            target.display()
        ));
    } else {
        log.op(format_args!("copy: {} -> {}", source.display(), target.display()));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
    }
    fs::copy(source, target).at(source)
}

/// Read a file that must be UTF-8 text.
pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).at(path)
}

#[tracing::instrument(level = "trace")]
pub fn fsync_path(path: &Path) -> Result<()> {
    tracing::trace!("running fsync");
    let file = fs::File::open(path).at(path)?;
    rustix::fs::fsync(&file)
        .map_err(std::io::Error::from)
        .at(path)
}
