//! Runtime configuration, read from a TOML file with every field defaulted.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IoContext, OverlayError, Result};
use crate::overlay::OverlayMode;

pub const SYSTEM_CONFIG_PATH: &str = "/etc/overstore.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub overlay: OverlayConfig,
    pub channels: ChannelsConfig,
    pub guard: GuardConfig,
    pub commands: CommandsConfig,
    pub listing: ListingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Number of normal path components below `/` that name a package
    /// directory (`/nix/store/<hash>-<name>` is 3).
    pub package_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub mode: OverlayMode,
    pub whole_store_base: PathBuf,
    pub package_base_root: PathBuf,
    /// Adds `index=off,metacopy=off` to the mount options. Unset means
    /// "on for whole-store, off for per-package".
    pub stale_handle_fix: Option<bool>,
    /// Advisory lock shared by every process that toggles the overlay.
    pub lock_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Defaults to `$HOME/.nix-defexpr/channels`.
    pub link: Option<PathBuf>,
    pub include: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub rebuild_command: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub mount: String,
    pub umount: String,
    pub diff: String,
    pub mountinfo: PathBuf,
    pub mount_timeout_secs: u64,
    pub diff_timeout_secs: u64,
    pub diff_color: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    pub max_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/nix/store"),
            package_depth: 3,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            mode: OverlayMode::PerPackage,
            whole_store_base: PathBuf::from("/nix/overlay-store"),
            package_base_root: PathBuf::from("/nix/overlay"),
            stale_handle_fix: None,
            lock_file: Some(PathBuf::from("/run/overstore.lock")),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            link: None,
            include: vec!["nixpkgs".to_owned()],
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            rebuild_command: Some(PathBuf::from("/run/current-system/sw/bin/nixos-rebuild")),
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            mount: "mount".to_owned(),
            umount: "umount".to_owned(),
            diff: "diff".to_owned(),
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
            mount_timeout_secs: 30,
            diff_timeout_secs: 60,
            diff_color: true,
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self { max_depth: 1 }
    }
}

impl CommandsConfig {
    pub const fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub const fn diff_timeout(&self) -> Duration {
        Duration::from_secs(self.diff_timeout_secs)
    }
}

impl OverlayConfig {
    pub fn stale_handle_fix_for(&self, mode: OverlayMode) -> bool {
        self.stale_handle_fix
            .unwrap_or(matches!(mode, OverlayMode::WholeStore))
    }
}

impl ChannelsConfig {
    pub fn resolve_link(&self) -> Result<PathBuf> {
        if let Some(link) = &self.link {
            return Ok(link.clone());
        }
        let home = std::env::var_os("HOME").ok_or_else(|| {
            OverlayError::Configuration(
                "HOME is not set and channels.link is not configured".to_owned(),
            )
        })?;
        Ok(Path::new(&home).join(".nix-defexpr/channels"))
    }
}

impl Config {
    pub fn from_toml(content: &str, origin: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| OverlayError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).at(path)?;
        Self::from_toml(&content, path)
    }

    /// Explicit path first, then the system file if present, then defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            tracing::debug!("loading config from {}", path.display());
            return Self::load_file(path);
        }
        let system = Path::new(SYSTEM_CONFIG_PATH);
        if system.is_file() {
            tracing::debug!("loading config from {}", system.display());
            return Self::load_file(system);
        }
        tracing::debug!("no config file, using defaults");
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.store.root, PathBuf::from("/nix/store"));
        assert_eq!(config.store.package_depth, 3);
        assert_eq!(config.overlay.mode, OverlayMode::PerPackage);
        assert_eq!(config.overlay.whole_store_base, PathBuf::from("/nix/overlay-store"));
        assert_eq!(config.overlay.package_base_root, PathBuf::from("/nix/overlay"));
        assert_eq!(config.channels.include, vec!["nixpkgs".to_owned()]);
        assert_eq!(config.commands.mountinfo, PathBuf::from("/proc/self/mountinfo"));
        assert_eq!(config.commands.mount_timeout(), Duration::from_secs(30));
        assert!(config.commands.diff_color);
        assert_eq!(config.listing.max_depth, 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [overlay]
            mode = "whole-store"
            lock_file = "/tmp/overstore.lock"

            [channels]
            include = ["nixpkgs", "home-manager"]

            [commands]
            diff_color = false
            "#,
            Path::new("test.toml"),
        )
        .unwrap();

        assert_eq!(config.overlay.mode, OverlayMode::WholeStore);
        assert_eq!(config.overlay.lock_file, Some(PathBuf::from("/tmp/overstore.lock")));
        assert_eq!(config.overlay.package_base_root, PathBuf::from("/nix/overlay"));
        assert_eq!(config.channels.include.len(), 2);
        assert!(!config.commands.diff_color);
        assert_eq!(config.commands.mount, "mount");
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_bad_toml_reports_origin() {
        let err = Config::from_toml("[overlay\nmode=", Path::new("/etc/broken.toml")).unwrap_err();
        assert!(matches!(err, OverlayError::Parse { ref path, .. } if path == Path::new("/etc/broken.toml")));
    }

    #[test]
    fn test_stale_handle_fix_follows_mode() {
        let mut overlay = OverlayConfig::default();
        assert!(overlay.stale_handle_fix_for(OverlayMode::WholeStore));
        assert!(!overlay.stale_handle_fix_for(OverlayMode::PerPackage));

        overlay.stale_handle_fix = Some(true);
        assert!(overlay.stale_handle_fix_for(OverlayMode::PerPackage));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overstore.toml");
        std::fs::write(&path, "[listing]\nmax_depth = 3\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.listing.max_depth, 3);
    }

    #[test]
    fn test_explicit_channels_link_wins() {
        let channels = ChannelsConfig {
            link: Some(PathBuf::from("/home/u/.nix-defexpr/channels")),
            include: vec![],
        };
        assert_eq!(
            channels.resolve_link().unwrap(),
            PathBuf::from("/home/u/.nix-defexpr/channels")
        );
    }
}
