//! Channel discovery and overlay target selection.
//!
//! The channels link (normally `~/.nix-defexpr/channels`, maintained by
//! `nix-channel`) points at a profile directory with one entry per channel.
//! Each entry resolves to a subdirectory of some store package; that package
//! is what gets overlaid.
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::Config;
use crate::error::{IoContext, OverlayError, Result};
use crate::overlay::{OverlayMode, OverlayTarget, resolve_dir_set, resolve_package_path};

const MANIFEST: &str = "manifest.nix";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub name: String,
    /// Fully resolved path inside the store.
    pub path: PathBuf,
}

/// Resolve the channels link and every channel in it, sorted by name.
#[tracing::instrument(level = "debug")]
pub fn discover_channels(link: &Path) -> Result<Vec<Channel>> {
    let dir = std::fs::canonicalize(link).at(link)?;
    tracing::debug!("resolved channels: {} -> {}", link.display(), dir.display());

    let mut channels = Vec::new();
    for entry in std::fs::read_dir(&dir).at(&dir)? {
        let entry = entry.at(&dir)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == MANIFEST {
            continue;
        }
        let entry_path = entry.path();
        let path = std::fs::canonicalize(&entry_path).at(&entry_path)?;
        tracing::debug!("found channel {name} -> {}", path.display());
        channels.push(Channel { name, path });
    }
    channels.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(channels)
}

/// Keep the channels named in `include`, in discovery order.
pub fn select(channels: Vec<Channel>, include: &[String]) -> Vec<Channel> {
    channels
        .into_iter()
        .filter(|c| include.iter().any(|name| name == &c.name))
        .collect()
}

/// Per-package overlay for one channel: the enclosing package is overlaid
/// from `<package_base_root>/<package dir name>`, and relative paths resolve
/// under `<package>/<channel name>`.
pub fn channel_target(channel: &Channel, config: &Config) -> Result<OverlayTarget> {
    let package = resolve_package_path(&channel.path, config.store.package_depth)?;
    let package_dir = package.file_name().ok_or_else(|| {
        OverlayError::Configuration(format!("no package dir in {}", package.display()))
    })?;
    let base = config.overlay.package_base_root.join(package_dir);
    let dirs = resolve_dir_set(OverlayMode::PerPackage, &package, &base)?;
    let tree_root = package.join(&channel.name);
    OverlayTarget::new(channel.name.clone(), dirs, tree_root)
}

/// The store root overlaid as a whole.
pub fn whole_store_target(config: &Config) -> Result<OverlayTarget> {
    let root = &config.store.root;
    let dirs = resolve_dir_set(OverlayMode::WholeStore, root, &config.overlay.whole_store_base)?;
    OverlayTarget::new("store", dirs, root.clone())
}

/// Every target the configured mode applies to.
pub fn configured_targets(config: &Config, mode: OverlayMode) -> Result<Vec<OverlayTarget>> {
    match mode {
        OverlayMode::WholeStore => Ok(vec![whole_store_target(config)?]),
        OverlayMode::PerPackage => {
            let link = config.channels.resolve_link()?;
            let channels = select(discover_channels(&link)?, &config.channels.include);
            if channels.is_empty() {
                return Err(OverlayError::Configuration(format!(
                    "none of the channels {:?} found in {}",
                    config.channels.include,
                    link.display()
                )));
            }
            channels.iter().map(|c| channel_target(c, config)).collect()
        }
    }
}
