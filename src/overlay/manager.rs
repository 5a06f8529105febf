//! Overlay lifecycle: start, stop and status of one overlay target.
//!
//! No state is kept between calls. Every operation starts by asking the
//! [`MountProbe`] what is mounted right now, which makes start and stop
//! idempotent and keeps the manager honest after external interference.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use file_lock::{FileLock, FileOptions};
use serde::Serialize;

use super::guard::RebuildGuard;
use super::{OverlayDirSet, OverlayLayout, OverlayTarget};
use crate::config::Config;
use crate::error::{IoContext, OverlayError, Result};
use crate::logging::LogConfig;
use crate::mount::{MountProbe, MountState, UNION_FS_TYPE};
use crate::process::{ProcessRunner, display_argv};
use crate::util;

/// Outcome of a start or stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transition {
    /// The mount table was changed.
    Performed,
    /// The overlay was already in the requested state; nothing was issued.
    AlreadyInState,
}

/// Proof that the caller holds the mount-state gate.
///
/// Everything that toggles the union mount takes a `&MountGate` so a diff
/// window (off, read, on, read) cannot interleave with another toggle.
pub struct MountGate<'a> {
    _local: MutexGuard<'a, ()>,
    _file: Option<FileLock>,
}

pub struct OverlayManager {
    target: OverlayTarget,
    probe: MountProbe,
    runner: Arc<dyn ProcessRunner>,
    mount_program: String,
    umount_program: String,
    timeout: Duration,
    stale_handle_fix: bool,
    guard: Option<RebuildGuard>,
    lock_file: Option<PathBuf>,
    gate: Mutex<()>,
    log: LogConfig,
}

impl std::fmt::Debug for OverlayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayManager")
            .field("target", &self.target)
            .field("stale_handle_fix", &self.stale_handle_fix)
            .finish_non_exhaustive()
    }
}

impl OverlayManager {
    pub fn new(
        target: OverlayTarget,
        runner: Arc<dyn ProcessRunner>,
        config: &Config,
        log: LogConfig,
    ) -> Self {
        let mode = target.dirs.mode();
        let guard = match target.dirs.layout {
            OverlayLayout::WholeStore { .. } => config
                .guard
                .rebuild_command
                .clone()
                .map(|command| RebuildGuard::new(command, log)),
            OverlayLayout::PerPackage { .. } => None,
        };
        Self {
            probe: MountProbe::new(Arc::clone(&runner), &config.commands, log),
            runner,
            mount_program: config.commands.mount.clone(),
            umount_program: config.commands.umount.clone(),
            timeout: config.commands.mount_timeout(),
            stale_handle_fix: config.overlay.stale_handle_fix_for(mode),
            guard,
            lock_file: config.overlay.lock_file.clone(),
            gate: Mutex::new(()),
            target,
            log,
        }
    }

    pub const fn target(&self) -> &OverlayTarget {
        &self.target
    }

    pub const fn dirs(&self) -> &OverlayDirSet {
        &self.target.dirs
    }

    pub const fn log(&self) -> LogConfig {
        self.log
    }

    /// Take the mount-state gate, blocking until it is free.
    pub fn lock(&self) -> Result<MountGate<'_>> {
        let local = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let file = match &self.lock_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).at(parent)?;
                }
                let options = FileOptions::new().write(true).create(true);
                tracing::trace!("waiting for lock {}", path.display());
                Some(FileLock::lock(path, true, options).at(path)?)
            }
            None => None,
        };
        Ok(MountGate {
            _local: local,
            _file: file,
        })
    }

    /// Whether the union is currently mounted over the target.
    pub fn is_active(&self) -> Result<bool> {
        self.probe.is_union_mounted(&self.target.dirs.mount)
    }

    /// Read-only report of the union and bind mounts. Never mutates.
    pub fn status(&self) -> Result<MountState> {
        let dirs = &self.target.dirs;
        let union = self.probe.is_union_mounted(&dirs.mount)?;
        let bind = match dirs.lower_backup() {
            Some(backup) => self.probe.is_bind_mounted(backup)?,
            None => false,
        };
        Ok(MountState::from_flags(union, bind))
    }

    pub fn start(&self) -> Result<Transition> {
        let gate = self.lock()?;
        self.start_locked(&gate)
    }

    pub fn stop(&self) -> Result<Transition> {
        let gate = self.lock()?;
        self.stop_locked(&gate)
    }

    /// Bring the union into the requested state.
    pub fn set_active_locked(&self, gate: &MountGate<'_>, active: bool) -> Result<Transition> {
        if active {
            self.start_locked(gate)
        } else {
            self.stop_locked(gate)
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(target = %self.target.name))]
    pub fn start_locked(&self, _gate: &MountGate<'_>) -> Result<Transition> {
        let dirs = &self.target.dirs;
        if !dirs.lower.is_dir() {
            return Err(OverlayError::NotFound(dirs.lower.clone()));
        }

        if self.probe.is_union_mounted(&dirs.mount)? {
            tracing::info!("already mounted: {}", dirs.mount.display());
            return Ok(Transition::AlreadyInState);
        }
        warn_if_unprivileged("start");

        util::ensure_dir(&dirs.upper, self.log)?;
        util::ensure_dir(&dirs.work, self.log)?;

        let bind_created = match dirs.lower_backup() {
            Some(backup) => self.bind_lower(&dirs.mount, backup)?,
            None => false,
        };

        let options = dirs.mount_options(self.stale_handle_fix);
        let mounted = self
            .mount(&["-t", UNION_FS_TYPE, UNION_FS_TYPE, "-o", &options], &dirs.mount)
            .and_then(|()| self.expect_union(true));
        if let Err(e) = mounted {
            self.recover_failed_start(bind_created);
            return Err(e);
        }

        tracing::info!(
            "success: mounted overlayfs on {}\n  lower: {}\n  upper: {}\n  work:  {}",
            dirs.mount.display(),
            dirs.lower.display(),
            dirs.upper.display(),
            dirs.work.display(),
        );

        match &dirs.layout {
            OverlayLayout::WholeStore { lower_backup } => {
                tracing::info!("lower view: {}", lower_backup.display());
                if let Some(guard) = &self.guard {
                    guard.engage(dirs)?;
                }
            }
            OverlayLayout::PerPackage { merge_link } => {
                util::symlink_if_missing(&dirs.mount, merge_link, self.log)?;
            }
        }
        Ok(Transition::Performed)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(target = %self.target.name))]
    pub fn stop_locked(&self, _gate: &MountGate<'_>) -> Result<Transition> {
        let dirs = &self.target.dirs;
        if !self.probe.is_union_mounted(&dirs.mount)? {
            tracing::info!("not mounted: {}", dirs.mount.display());
            // a failed rollback can strand the lower view on its own
            return Ok(if self.detach_lower_backup()? {
                Transition::Performed
            } else {
                Transition::AlreadyInState
            });
        }

        for (role, path) in dirs.members() {
            if !path.exists() {
                return Err(OverlayError::InconsistentState {
                    role,
                    path: path.to_path_buf(),
                });
            }
        }
        warn_if_unprivileged("stop");

        self.unmount_union()?;
        tracing::info!("success: stopped overlayfs on {}", dirs.mount.display());

        self.detach_lower_backup()?;
        Ok(Transition::Performed)
    }

    /// Lazily unmount the whole-store lower view if it is mounted.
    /// Returns whether an unmount was issued.
    fn detach_lower_backup(&self) -> Result<bool> {
        let Some(backup) = self.target.dirs.lower_backup() else {
            return Ok(false);
        };
        if !self.probe.is_bind_mounted(backup)? {
            tracing::info!("not mounted: {}", backup.display());
            return Ok(false);
        }
        self.umount(&["--lazy"], backup)?;
        tracing::info!("success: unmounted lower view from {}", backup.display());
        Ok(true)
    }

    /// Expose the original tree at `backup` before the union shadows it.
    /// Returns whether a new bind mount was created.
    fn bind_lower(&self, source: &Path, backup: &Path) -> Result<bool> {
        util::ensure_dir(backup, self.log)?;
        if self.probe.is_bind_mounted(backup)? {
            tracing::info!("already mounted: {}", backup.display());
            return Ok(false);
        }
        self.mount(&["--bind", &source.to_string_lossy()], backup)?;
        if let Err(e) = self.mount(&["--make-private"], backup) {
            self.rollback_bind(backup);
            return Err(e);
        }
        Ok(true)
    }

    /// Leave the target unmounted after a failed union mount, judged by the
    /// probe rather than by the failed command.
    fn recover_failed_start(&self, bind_created: bool) {
        let dirs = &self.target.dirs;
        match self.probe.is_union_mounted(&dirs.mount) {
            Ok(true) => {
                tracing::warn!("union visible despite failure, detaching {}", dirs.mount.display());
                if let Err(e) = self.umount(&["--lazy", "-t", UNION_FS_TYPE], &dirs.mount) {
                    tracing::error!("failed to detach {}: {e}", dirs.mount.display());
                }
            }
            Ok(false) => {}
            Err(e) => tracing::error!("cannot verify mount state of {}: {e}", dirs.mount.display()),
        }
        if bind_created {
            if let Some(backup) = dirs.lower_backup() {
                self.rollback_bind(backup);
            }
        }
    }

    fn rollback_bind(&self, backup: &Path) {
        tracing::warn!("rolling back bind mount at {}", backup.display());
        if let Err(e) = self.umount(&["--lazy"], backup) {
            tracing::error!("failed to roll back bind mount at {}: {e}", backup.display());
        }
    }

    /// Plain unmount first; a busy target falls back to a deferred unmount
    /// so open handles cannot wedge the overlay.
    fn unmount_union(&self) -> Result<()> {
        let mount = &self.target.dirs.mount;
        if let Err(e) = self.umount(&["-t", UNION_FS_TYPE], mount) {
            tracing::warn!("{e}; retrying with deferred unmount");
            self.umount(&["--lazy", "-t", UNION_FS_TYPE], mount)?;
        }
        self.expect_union(false)
    }

    fn expect_union(&self, mounted: bool) -> Result<()> {
        let mount = &self.target.dirs.mount;
        if self.probe.is_union_mounted(mount)? == mounted {
            return Ok(());
        }
        Err(OverlayError::Mount {
            command: format!("{} {}", self.mount_program, mount.display()),
            code: Some(0),
            stderr: if mounted {
                "union mount not visible in the mount table after mounting".to_owned()
            } else {
                "union mount still present after unmounting".to_owned()
            },
        })
    }

    fn mount(&self, args: &[&str], target: &Path) -> Result<()> {
        self.exec(&self.mount_program, args, target)
    }

    fn umount(&self, args: &[&str], target: &Path) -> Result<()> {
        self.exec(&self.umount_program, args, target)
    }

    fn exec(&self, program: &str, args: &[&str], target: &Path) -> Result<()> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        argv.push(program.to_owned());
        argv.extend(args.iter().map(|a| (*a).to_owned()));
        argv.push(target.to_string_lossy().into_owned());

        let out = self.runner.run(&argv, self.timeout)?;
        if out.success() {
            return Ok(());
        }
        Err(OverlayError::Mount {
            command: display_argv(&argv),
            code: out.status,
            stderr: out.stderr,
        })
    }
}

fn warn_if_unprivileged(action: &str) {
    if !rustix::process::geteuid().is_root() {
        tracing::warn!("not running as root, {action} will likely fail");
    }
}
