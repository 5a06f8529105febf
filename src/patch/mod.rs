//! Diff and patch against an overlaid package tree.
//!
//! The merged view is mounted directly over the lower directory, so the raw
//! lower content is only readable while the union is down. Every comparison
//! therefore toggles the overlay around its reads, under the manager's mount
//! gate, and puts it back the way it found it before the diff utility runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::CommandsConfig;
use crate::error::{IoContext, OverlayError, Result};
use crate::logging::LogConfig;
use crate::overlay::manager::MountGate;
use crate::overlay::{OverlayManager, validate_relative};
use crate::process::{ProcessRunner, display_argv};
use crate::util;

/// An externally supplied version of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    /// Shown in the diff header instead of the local path.
    pub label: Option<String>,
}

impl Candidate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            label: None,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Which view of the store file a candidate is compared against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffBase {
    /// The immutable original (overlay off).
    #[default]
    Lower,
    /// The merged view, including anything patched before (overlay on).
    Merged,
}

impl DiffBase {
    const fn overlay_active(self) -> bool {
        matches!(self, Self::Merged)
    }

    const fn describe(self) -> &'static str {
        match self {
            Self::Lower => "overlay off",
            Self::Merged => "overlay on",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffOutcome {
    pub before_text: String,
    pub after_text: String,
    /// Raw diff utility output; may carry ANSI colors.
    pub unified_diff: String,
}

impl DiffOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.unified_diff.trim().is_empty()
    }
}

pub struct DiffEngine {
    manager: Arc<OverlayManager>,
    runner: Arc<dyn ProcessRunner>,
    diff_program: String,
    color: bool,
    timeout: Duration,
    log: LogConfig,
}

impl DiffEngine {
    pub fn new(
        manager: Arc<OverlayManager>,
        runner: Arc<dyn ProcessRunner>,
        commands: &CommandsConfig,
    ) -> Self {
        let log = manager.log();
        Self {
            manager,
            runner,
            diff_program: commands.diff.clone(),
            color: commands.diff_color,
            timeout: commands.diff_timeout(),
            log,
        }
    }

    pub const fn manager(&self) -> &Arc<OverlayManager> {
        &self.manager
    }

    /// Compare a store file against `candidate`, or, without a candidate,
    /// against what the overlay currently makes of it.
    pub fn diff(&self, lower_rel: &Path, candidate: Option<&Candidate>) -> Result<DiffOutcome> {
        match candidate {
            Some(candidate) => self.diff_against(lower_rel, candidate, DiffBase::Lower),
            None => self.overlay_diff(lower_rel),
        }
    }

    /// Compare the `base` view of a store file with a candidate file.
    #[tracing::instrument(level = "debug", skip(self, candidate), fields(candidate = %candidate.path.display()))]
    pub fn diff_against(&self, lower_rel: &Path, candidate: &Candidate, base: DiffBase) -> Result<DiffOutcome> {
        let rel = validate_relative(lower_rel)?;
        require_file(&candidate.path)?;
        let after_text = util::read_text(&candidate.path)?;

        let snapshots = snapshot_dir()?;
        let before = snapshots.path().join("a.store.txt");
        {
            let gate = self.manager.lock()?;
            let view = self.manager.target().view_path(&rel);
            require_file(&view)?;

            let was_active = self.manager.is_active()?;
            let captured = self
                .manager
                .set_active_locked(&gate, base.overlay_active())
                .and_then(|_| {
                    require_file(&view)?;
                    util::copy_file(&view, &before, self.log).map(drop)
                });
            let restored = self.restore(&gate, was_active);
            captured?;
            restored?;
        }

        let before_text = util::read_text(&before)?;
        let tree = self.manager.target().tree_root.display();
        let before_label = format!("a/{} in {tree} ({})", rel.display(), base.describe());
        let after_label = format!("b/{} == {}", rel.display(), candidate.display_label());
        let unified_diff = self.run_diff(&before_label, &before, &after_label, &candidate.path)?;

        Ok(DiffOutcome {
            before_text,
            after_text,
            unified_diff,
        })
    }

    /// Show what the overlay changes about a store file: its content with
    /// the overlay off against its content with the overlay on.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn overlay_diff(&self, lower_rel: &Path) -> Result<DiffOutcome> {
        let rel = validate_relative(lower_rel)?;

        let snapshots = snapshot_dir()?;
        let lower_snap = snapshots.path().join("a.lower.txt");
        let merge_snap = snapshots.path().join("b.merge.txt");
        {
            let gate = self.manager.lock()?;
            let view = self.manager.target().view_path(&rel);
            require_file(&view)?;

            let was_active = self.manager.is_active()?;
            let captured = if was_active {
                self.snapshot(&view, &merge_snap)
                    .and_then(|()| self.manager.stop_locked(&gate))
                    .and_then(|_| self.snapshot(&view, &lower_snap))
            } else {
                self.snapshot(&view, &lower_snap)
                    .and_then(|()| self.manager.start_locked(&gate))
                    .and_then(|_| self.snapshot(&view, &merge_snap))
            };
            let restored = self.restore(&gate, was_active);
            captured?;
            restored?;
        }

        let before_text = util::read_text(&lower_snap)?;
        let after_text = util::read_text(&merge_snap)?;
        let tree = self.manager.target().tree_root.display();
        let unified_diff = self.run_diff(
            &format!("a/{} in {tree} (overlay off)", rel.display()),
            &lower_snap,
            &format!("b/{} in {tree} (overlay on)", rel.display()),
            &merge_snap,
        )?;

        Ok(DiffOutcome {
            before_text,
            after_text,
            unified_diff,
        })
    }

    /// Write `candidate` over a store file. The overlay is brought up first
    /// so the write goes through the merged view into the upper dir and the
    /// lower tree is never touched. Returns the file's path in the upper dir.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn patch(&self, lower_rel: &Path, candidate: &Path) -> Result<PathBuf> {
        let rel = validate_relative(lower_rel)?;
        require_file(candidate)?;

        let gate = self.manager.lock()?;
        let target = self.manager.target();
        let view = target.view_path(&rel);
        require_file(&view)?;

        self.manager.start_locked(&gate)?;
        if !self.manager.is_active()? {
            return Err(OverlayError::InconsistentState {
                role: "merge",
                path: target.dirs.mount.clone(),
            });
        }

        util::copy_file(candidate, &view, self.log)?;
        util::fsync_path(&view)?;

        let upper = target.upper_path(&rel);
        tracing::info!("patched {} (stored in {})", view.display(), upper.display());
        Ok(upper)
    }

    fn restore(&self, gate: &MountGate<'_>, was_active: bool) -> Result<()> {
        self.manager
            .set_active_locked(gate, was_active)
            .map(drop)
            .inspect_err(|e| tracing::error!("failed to restore overlay state: {e}"))
    }

    /// Copy the file as currently visible; a file missing from this view
    /// snapshots as empty.
    fn snapshot(&self, view: &Path, dest: &Path) -> Result<()> {
        if view.is_file() {
            return util::copy_file(view, dest, self.log).map(drop);
        }
        self.log
            .op(format_args!("{} absent in this view, snapshot empty", view.display()));
        std::fs::write(dest, "").at(dest)
    }

    fn run_diff(&self, a_label: &str, a: &Path, b_label: &str, b: &Path) -> Result<String> {
        let mut argv = vec![self.diff_program.clone(), "-u".to_owned()];
        if self.color {
            argv.push("--color=always".to_owned());
        }
        argv.extend([
            "--label".to_owned(),
            a_label.to_owned(),
            a.to_string_lossy().into_owned(),
            "--label".to_owned(),
            b_label.to_owned(),
            b.to_string_lossy().into_owned(),
        ]);

        let out = self.runner.run(&argv, self.timeout)?;
        // 0: identical, 1: files differ
        match out.status {
            Some(0 | 1) => Ok(out.stdout),
            code => Err(OverlayError::Diff {
                command: display_argv(&argv),
                code,
                stderr: out.stderr,
            }),
        }
    }
}

fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(OverlayError::NotFound(path.to_path_buf()))
    }
}

fn snapshot_dir() -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("overstore-diff-")
        .tempdir()
        .at(std::env::temp_dir())
}
