//! Keeps the system rebuild command out of reach while the whole store is
//! overlaid.
//!
//! A rebuild run with the overlay mounted writes every new store path into
//! the upper dir. Those paths disappear on unmount while the boot entries
//! still point at them.
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::OverlayDirSet;
use crate::error::{IoContext, Result};
use crate::logging::LogConfig;

const GUARD_MODE: u32 = 0o555;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuardAction {
    /// The real command was renamed aside.
    Disabled,
    /// The command was already renamed aside; a guard script now stands in
    /// for it.
    ScriptInstalled,
    /// Neither the command nor its disabled copy exist.
    Missing,
}

#[derive(Debug, Clone)]
pub struct RebuildGuard {
    command: PathBuf,
    log: LogConfig,
}

fn exists_no_follow(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

impl RebuildGuard {
    pub const fn new(command: PathBuf, log: LogConfig) -> Self {
        Self { command, log }
    }

    /// `<dir>/.<name>--disabled`
    pub fn disabled_path(&self) -> PathBuf {
        let name = self
            .command
            .file_name()
            .map_or_else(|| "rebuild".into(), |n| n.to_string_lossy());
        self.command.with_file_name(format!(".{name}--disabled"))
    }

    pub fn engage(&self, dirs: &OverlayDirSet) -> Result<GuardAction> {
        let disabled = self.disabled_path();
        tracing::info!(
            "disabling {}. stop the overlay to run it",
            self.command.display()
        );

        if !exists_no_follow(&disabled) {
            if !exists_no_follow(&self.command) {
                tracing::warn!("no rebuild command at {}", self.command.display());
                return Ok(GuardAction::Missing);
            }
            self.log.op(format_args!(
                "rename: {} -> {}",
                self.command.display(),
                disabled.display()
            ));
            std::fs::rename(&self.command, &disabled).at(&self.command)?;
            return Ok(GuardAction::Disabled);
        }

        if exists_no_follow(&self.command) {
            std::fs::remove_file(&self.command).at(&self.command)?;
        }
        self.log
            .op(format_args!("write guard script: {}", self.command.display()));
        std::fs::write(&self.command, self.script(dirs)).at(&self.command)?;
        std::fs::set_permissions(&self.command, std::fs::Permissions::from_mode(GUARD_MODE))
            .at(&self.command)?;
        Ok(GuardAction::ScriptInstalled)
    }

    /// Shell script explaining why the command is gone and how to get it
    /// back.
    pub fn script(&self, dirs: &OverlayDirSet) -> String {
        let name = self
            .command
            .file_name()
            .map_or_else(|| "the rebuild command".into(), |n| n.to_string_lossy());
        let this = std::env::current_exe()
            .map_or_else(|_| "overstore".to_owned(), |p| p.display().to_string());

        let mut lines = vec![
            "#! /usr/bin/env bash".to_owned(),
            String::new(),
            "cat <<'EOF'".to_owned(),
            format!("{name} was disabled by overstore"),
            String::new(),
            format!("the original file is in {}", self.disabled_path().display()),
            String::new(),
            format!("{name} must not run while the store overlay is active:"),
            "new store paths would be written to the upper dir".to_owned(),
            format!("({}) and vanish when the overlay stops,", dirs.upper.display()),
            "leaving the booted system pointing at missing paths.".to_owned(),
            String::new(),
            format!("to run {name}, first stop the overlay by running"),
            format!("sudo {this} --whole-store stop"),
            String::new(),
            "to manually stop the overlay, you can run".to_owned(),
            format!("sudo umount --lazy -t overlay {}", dirs.mount.display()),
        ];
        if let Some(backup) = dirs.lower_backup() {
            lines.push(format!("sudo umount --lazy {}", backup.display()));
        }
        lines.push("EOF".to_owned());
        lines.push("exit 1".to_owned());
        lines.join("\n") + "\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{OverlayMode, resolve_dir_set};

    fn dirs() -> OverlayDirSet {
        resolve_dir_set(
            OverlayMode::WholeStore,
            Path::new("/nix/store"),
            Path::new("/nix/overlay-store"),
        )
        .unwrap()
    }

    #[test]
    fn test_disabled_path_is_hidden_sibling() {
        let guard = RebuildGuard::new(
            PathBuf::from("/run/current-system/sw/bin/nixos-rebuild"),
            LogConfig::default(),
        );
        assert_eq!(
            guard.disabled_path(),
            PathBuf::from("/run/current-system/sw/bin/.nixos-rebuild--disabled")
        );
    }

    #[test]
    fn test_first_engage_renames_then_installs_script() {
        let tmp = tempfile::tempdir().unwrap();
        let command = tmp.path().join("nixos-rebuild");
        std::fs::write(&command, "#!/bin/sh\necho real\n").unwrap();
        let guard = RebuildGuard::new(command.clone(), LogConfig::default());

        assert_eq!(guard.engage(&dirs()).unwrap(), GuardAction::Disabled);
        assert!(!command.exists());
        assert_eq!(
            std::fs::read_to_string(guard.disabled_path()).unwrap(),
            "#!/bin/sh\necho real\n"
        );

        assert_eq!(guard.engage(&dirs()).unwrap(), GuardAction::ScriptInstalled);
        let script = std::fs::read_to_string(&command).unwrap();
        assert!(script.contains("nixos-rebuild was disabled"));
        assert!(script.contains("sudo umount --lazy -t overlay /nix/store"));
        assert!(script.contains("sudo umount --lazy /nix/overlay-store/lower"));
        let mode = std::fs::metadata(&command).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);

        // the disabled original is untouched
        assert_eq!(
            std::fs::read_to_string(guard.disabled_path()).unwrap(),
            "#!/bin/sh\necho real\n"
        );
    }

    #[test]
    fn test_missing_command_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let guard = RebuildGuard::new(tmp.path().join("nixos-rebuild"), LogConfig::default());
        assert_eq!(guard.engage(&dirs()).unwrap(), GuardAction::Missing);
    }
}
