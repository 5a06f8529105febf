//! Overlay targets and their directory sets.
//!
//! An overlay is always described by a lower directory (the immutable store
//! path) and an overlay base under which the writable state lives. The two
//! supported layouts differ in how the original lower view stays reachable
//! once the union is mounted over it:
//!
//! - [`OverlayMode::WholeStore`] mounts the union over the store root and
//!   keeps the pristine tree reachable through a private bind mount at
//!   `<base>/lower`.
//! - [`OverlayMode::PerPackage`] mounts the union over one package directory
//!   and leaves a `<base>/merge` symlink pointing at the merged view.
//!
//! When the base coincides with the lower directory the role directories are
//! placed next to it as `<base>.overlayfs.<role>` so they never end up inside
//! the tree they overlay.
pub mod guard;
pub mod manager;

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, Result};

pub use manager::{OverlayManager, Transition};

const UPPER_DIR: &str = "upper";
const WORK_DIR: &str = "work";
const LOWER_BACKUP_DIR: &str = "lower";
const MERGE_LINK: &str = "merge";
const SIBLING_SEPARATOR: &str = ".overlayfs.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayMode {
    WholeStore,
    #[default]
    PerPackage,
}

impl std::fmt::Display for OverlayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::WholeStore => "whole-store",
            Self::PerPackage => "per-package",
        })
    }
}

/// Mode-specific members of a directory set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayLayout {
    WholeStore {
        /// Bind mount of the original tree, reachable while the union
        /// shadows `mount`.
        lower_backup: PathBuf,
    },
    PerPackage {
        /// Discoverability symlink pointing at `mount`.
        merge_link: PathBuf,
    },
}

/// The directories a union mount is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayDirSet {
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    /// Where the merged view is mounted. Always the lower path itself.
    pub mount: PathBuf,
    pub layout: OverlayLayout,
}

impl OverlayDirSet {
    pub const fn mode(&self) -> OverlayMode {
        match self.layout {
            OverlayLayout::WholeStore { .. } => OverlayMode::WholeStore,
            OverlayLayout::PerPackage { .. } => OverlayMode::PerPackage,
        }
    }

    pub fn lower_backup(&self) -> Option<&Path> {
        match &self.layout {
            OverlayLayout::WholeStore { lower_backup } => Some(lower_backup),
            OverlayLayout::PerPackage { .. } => None,
        }
    }

    /// Option string handed to the union filesystem driver.
    pub fn mount_options(&self, stale_handle_fix: bool) -> String {
        let mut options = vec![
            format!("lowerdir={}", self.lower.display()),
            format!("upperdir={}", self.upper.display()),
            format!("workdir={}", self.work.display()),
        ];
        if stale_handle_fix {
            options.push("index=off".to_owned());
            options.push("metacopy=off".to_owned());
        }
        options.join(",")
    }

    /// Role directories the union needs, in the order they are checked.
    pub fn members(&self) -> Vec<(&'static str, &Path)> {
        let mut members = vec![
            ("lower", self.lower.as_path()),
            ("upper", self.upper.as_path()),
            ("work", self.work.as_path()),
            ("merge", self.mount.as_path()),
        ];
        if let Some(backup) = self.lower_backup() {
            members.push(("lower backup", backup));
        }
        members
    }

    /// The writable path inside `upper` that shadows `lower/<relative>`.
    pub fn upper_path(&self, relative: &Path) -> PathBuf {
        self.upper.join(relative)
    }

    fn validate(&self) -> Result<()> {
        let roles = [
            ("lower", &self.lower),
            ("upper", &self.upper),
            ("work", &self.work),
        ];
        for (i, (a_role, a)) in roles.iter().enumerate() {
            for (b_role, b) in &roles[i + 1..] {
                if a == b {
                    return Err(OverlayError::Configuration(format!(
                        "{a_role} and {b_role} dirs must differ: {}",
                        a.display()
                    )));
                }
            }
        }
        for (role, dir) in [("upper", &self.upper), ("work", &self.work)] {
            if dir.starts_with(&self.lower) {
                return Err(OverlayError::Configuration(format!(
                    "{role} dir {} lies inside lower dir {}",
                    dir.display(),
                    self.lower.display()
                )));
            }
        }
        Ok(())
    }
}

fn role_dir(lower: &Path, base: &Path, role: &str) -> PathBuf {
    if lower == base {
        PathBuf::from(format!("{}{SIBLING_SEPARATOR}{role}", base.display()))
    } else {
        base.join(role)
    }
}

/// Derive the directory set for `lower_dir` with writable state under
/// `overlay_base`.
pub fn resolve_dir_set(mode: OverlayMode, lower_dir: &Path, overlay_base: &Path) -> Result<OverlayDirSet> {
    if overlay_base.as_os_str().is_empty() {
        return Err(OverlayError::Configuration("overlay base is required".to_owned()));
    }
    if lower_dir.as_os_str().is_empty() {
        return Err(OverlayError::Configuration("lower dir is required".to_owned()));
    }

    let layout = match mode {
        OverlayMode::WholeStore => OverlayLayout::WholeStore {
            lower_backup: role_dir(lower_dir, overlay_base, LOWER_BACKUP_DIR),
        },
        OverlayMode::PerPackage => OverlayLayout::PerPackage {
            merge_link: role_dir(lower_dir, overlay_base, MERGE_LINK),
        },
    };

    let dirs = OverlayDirSet {
        lower: lower_dir.to_path_buf(),
        upper: role_dir(lower_dir, overlay_base, UPPER_DIR),
        work: role_dir(lower_dir, overlay_base, WORK_DIR),
        mount: lower_dir.to_path_buf(),
        layout,
    };
    dirs.validate()?;
    Ok(dirs)
}

/// Truncate a resolved store path to its enclosing package directory.
///
/// `depth` counts normal components below `/`, so with the default of 3
/// `/nix/store/<hash>-nixpkgs/nixpkgs/lib` becomes `/nix/store/<hash>-nixpkgs`.
/// Paths shallower than `depth` are rejected rather than silently truncated.
pub fn resolve_package_path(subdir_path: &Path, depth: usize) -> Result<PathBuf> {
    if !subdir_path.is_absolute() {
        return Err(OverlayError::Configuration(format!(
            "store path must be absolute: {}",
            subdir_path.display()
        )));
    }
    let mut package = PathBuf::from("/");
    let mut taken = 0;
    for component in subdir_path.components() {
        if taken == depth {
            break;
        }
        match component {
            Component::Normal(part) => {
                package.push(part);
                taken += 1;
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(OverlayError::Configuration(format!(
                    "store path must be normalized: {}",
                    subdir_path.display()
                )));
            }
        }
    }
    if taken < depth {
        return Err(OverlayError::Configuration(format!(
            "{} is not inside a package directory ({depth} levels deep)",
            subdir_path.display()
        )));
    }
    Ok(package)
}

/// Check a path that is meant to be relative to a package tree.
pub fn validate_relative(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(OverlayError::Configuration("relative path is empty".to_owned()));
    }
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(OverlayError::Configuration(format!(
                    "path must be relative to the package tree: {}",
                    path.display()
                )));
            }
            Component::ParentDir => {
                return Err(OverlayError::Configuration(format!(
                    "path must not leave the package tree: {}",
                    path.display()
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(OverlayError::Configuration("relative path is empty".to_owned()));
    }
    Ok(clean)
}

/// A fully resolved overlay: what to mount, and the tree diff/patch paths
/// are relative to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayTarget {
    pub name: String,
    pub dirs: OverlayDirSet,
    /// Root that lower-relative paths are resolved against. Equal to
    /// `dirs.lower` or a subdirectory of it.
    pub tree_root: PathBuf,
}

impl OverlayTarget {
    pub fn new(name: impl Into<String>, dirs: OverlayDirSet, tree_root: PathBuf) -> Result<Self> {
        if !tree_root.starts_with(&dirs.lower) {
            return Err(OverlayError::Configuration(format!(
                "tree root {} is outside lower dir {}",
                tree_root.display(),
                dirs.lower.display()
            )));
        }
        Ok(Self {
            name: name.into(),
            dirs,
            tree_root,
        })
    }

    /// Path seen through the mount point (lower when off, merged when on).
    pub fn view_path(&self, relative: &Path) -> PathBuf {
        self.tree_root.join(relative)
    }

    /// Path of the same file inside the upper dir.
    pub fn upper_path(&self, relative: &Path) -> PathBuf {
        let below_lower = self
            .tree_root
            .strip_prefix(&self.dirs.lower)
            .unwrap_or_else(|_| Path::new(""));
        self.dirs.upper_path(&below_lower.join(relative))
    }
}
