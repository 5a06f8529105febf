//! Test doubles: a fake host that answers `mount`, `umount` and `diff`.
//!
//! Union mounts are emulated on real directories: mounting moves the
//! original tree aside and materializes the merged view (lower, then upper)
//! at the mount point; unmounting copies every changed file back into the
//! upper dir and restores the original tree. That is enough to observe the
//! shadowing behavior the overlay code has to work around.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::config::Config;
use crate::error::Result;
use crate::logging::LogConfig;
use crate::overlay::{OverlayManager, OverlayMode, OverlayTarget, resolve_dir_set};
use crate::patch::DiffEngine;
use crate::process::{ProcessOutput, ProcessRunner};

const FAKE_DEVICE: &str = "/dev/fake0";

#[derive(Debug)]
struct FakeMount {
    id: usize,
    source: String,
    mount_point: PathBuf,
    fs_type: String,
    union: Option<UnionState>,
}

#[derive(Debug)]
struct UnionState {
    upper: PathBuf,
    stash: PathBuf,
}

#[derive(Debug)]
struct Failure {
    prefix: Vec<String>,
    code: i32,
    stderr: String,
}

#[derive(Debug, Default)]
struct FakeState {
    mounts: Vec<FakeMount>,
    calls: Vec<Vec<String>>,
    failures: Vec<Failure>,
    next_id: usize,
}

#[derive(Debug)]
pub struct FakeSystem {
    scratch: TempDir,
    state: Mutex<FakeState>,
}

fn out(status: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> ProcessOutput {
    ProcessOutput {
        status: Some(status),
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

fn copy_tree(from: &Path, to: &Path) {
    if !from.is_dir() {
        return;
    }
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        let ty = entry.file_type().unwrap();
        if ty.is_dir() {
            copy_tree(&entry.path(), &target);
        } else if ty.is_symlink() {
            fs::remove_file(&target).ok();
            std::os::unix::fs::symlink(fs::read_link(entry.path()).unwrap(), &target).unwrap();
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

/// Copy files under `merged` that differ from `original` into `upper`.
fn sync_changes(merged: &Path, original: &Path, upper: &Path, rel: &Path) {
    for entry in fs::read_dir(merged.join(rel)).unwrap() {
        let entry = entry.unwrap();
        let rel_path = rel.join(entry.file_name());
        let ty = entry.file_type().unwrap();
        if ty.is_dir() {
            sync_changes(merged, original, upper, &rel_path);
        } else if ty.is_file() {
            let current = fs::read(entry.path()).unwrap();
            if fs::read(original.join(&rel_path)).ok().as_deref() != Some(current.as_slice()) {
                let dest = upper.join(&rel_path);
                fs::create_dir_all(dest.parent().unwrap()).unwrap();
                fs::write(dest, current).unwrap();
            }
        }
    }
}

impl FakeSystem {
    pub fn new() -> Arc<Self> {
        let scratch = tempfile::tempdir().unwrap();
        let fake = Self {
            scratch,
            state: Mutex::new(FakeState::default()),
        };
        fake.write_mountinfo(&fake.state.lock().unwrap());
        Arc::new(fake)
    }

    pub fn mountinfo_path(&self) -> PathBuf {
        self.scratch.path().join("mountinfo")
    }

    /// Config wired to this fake: no lock file, no rebuild guard, plain
    /// diff output.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.commands.mountinfo = self.mountinfo_path();
        config.commands.diff_color = false;
        config.overlay.lock_file = None;
        config.guard.rebuild_command = None;
        config
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls whose argv starts with `prefix`.
    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls()
            .iter()
            .filter(|argv| argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p))
            .count()
    }

    /// Calls that change the mount table (everything but the listing).
    pub fn mutating_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|argv| (argv[0] == "mount" && argv.len() > 1) || argv[0] == "umount")
            .count()
    }

    /// Make the next call starting with `prefix` exit with `code`.
    pub fn fail_next(&self, prefix: &[&str], code: i32, stderr: &str) {
        self.state.lock().unwrap().failures.push(Failure {
            prefix: prefix.iter().map(|s| (*s).to_owned()).collect(),
            code,
            stderr: stderr.to_owned(),
        });
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state
            .lock()
            .unwrap()
            .mounts
            .iter()
            .any(|m| m.mount_point == path)
    }

    fn write_mountinfo(&self, state: &FakeState) {
        let mut table = String::from("21 1 8:1 / / rw,relatime shared:1 - ext4 /dev/fake0 rw\n");
        for m in &state.mounts {
            table.push_str(&format!(
                "{} 21 0:{} / {} rw,relatime - {} {} rw\n",
                100 + m.id,
                m.id,
                m.mount_point.display(),
                m.fs_type,
                m.source
            ));
        }
        fs::write(self.mountinfo_path(), table).unwrap();
    }

    fn listing(state: &FakeState) -> String {
        let mut text = format!("{FAKE_DEVICE} on / type ext4 (rw,relatime)\n");
        for m in &state.mounts {
            text.push_str(&format!(
                "{} on {} type {} (rw,relatime)\n",
                m.source,
                m.mount_point.display(),
                m.fs_type
            ));
        }
        text
    }

    fn mount(&self, state: &mut FakeState, args: &[String]) -> ProcessOutput {
        match args {
            [] => out(0, Self::listing(state), ""),
            [flag, source, target] if flag == "--bind" => {
                state.next_id += 1;
                state.mounts.push(FakeMount {
                    id: state.next_id,
                    source: format!("{FAKE_DEVICE}[{source}]"),
                    mount_point: PathBuf::from(target),
                    fs_type: "ext4".to_owned(),
                    union: None,
                });
                out(0, "", "")
            }
            [flag, target] if flag == "--make-private" => {
                if state.mounts.iter().any(|m| m.mount_point == Path::new(target)) {
                    out(0, "", "")
                } else {
                    out(32, "", format!("mount: {target}: not mount point or bad option."))
                }
            }
            [t, fs_type, _source, o, options, target] if t == "-t" && o == "-o" => {
                let upper = options
                    .split(',')
                    .find_map(|opt| opt.strip_prefix("upperdir="))
                    .map(PathBuf::from)
                    .unwrap();
                let mount_point = PathBuf::from(target);
                state.next_id += 1;
                let stash = self.scratch.path().join(format!("stash-{}", state.next_id));
                fs::rename(&mount_point, &stash).unwrap();
                fs::create_dir_all(&mount_point).unwrap();
                copy_tree(&stash, &mount_point);
                copy_tree(&upper, &mount_point);
                state.mounts.push(FakeMount {
                    id: state.next_id,
                    source: fs_type.clone(),
                    mount_point,
                    fs_type: fs_type.clone(),
                    union: Some(UnionState { upper, stash }),
                });
                out(0, "", "")
            }
            _ => out(1, "", format!("mount: unsupported arguments {args:?}")),
        }
    }

    fn umount(state: &mut FakeState, args: &[String]) -> ProcessOutput {
        let Some(target) = args.last() else {
            return out(1, "", "umount: missing target");
        };
        let Some(idx) = state.mounts.iter().rposition(|m| m.mount_point == Path::new(target)) else {
            return out(32, "", format!("umount: {target}: not mounted."));
        };
        let removed = state.mounts.remove(idx);
        if let Some(union) = removed.union {
            sync_changes(&removed.mount_point, &union.stash, &union.upper, Path::new(""));
            fs::remove_dir_all(&removed.mount_point).unwrap();
            fs::rename(&union.stash, &removed.mount_point).unwrap();
        }
        out(0, "", "")
    }

    fn diff(args: &[String]) -> ProcessOutput {
        let mut labels = Vec::new();
        let mut paths = Vec::new();
        let mut i = 0;
        while i < args.len() {
            if args[i] == "--label" {
                labels.push(args[i + 1].clone());
                paths.push(PathBuf::from(&args[i + 2]));
                i += 3;
            } else {
                i += 1;
            }
        }
        let (Ok(a), Ok(b)) = (fs::read_to_string(&paths[0]), fs::read_to_string(&paths[1])) else {
            return out(2, "", "diff: No such file or directory");
        };
        if a == b {
            return out(0, "", "");
        }
        let diff = similar::TextDiff::from_lines(&a, &b);
        let text = diff.unified_diff().header(&labels[0], &labels[1]).to_string();
        out(1, text, "")
    }
}

impl ProcessRunner for FakeSystem {
    fn run(&self, argv: &[String], _timeout: Duration) -> Result<ProcessOutput> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(argv.to_vec());

        if let Some(pos) = state.failures.iter().position(|f| {
            argv.len() >= f.prefix.len() && argv.iter().zip(&f.prefix).all(|(a, p)| a == p)
        }) {
            let failure = state.failures.remove(pos);
            return Ok(out(failure.code, "", failure.stderr));
        }

        let result = match argv[0].as_str() {
            "mount" => self.mount(&mut state, &argv[1..]),
            "umount" => Self::umount(&mut state, &argv[1..]),
            "diff" => Self::diff(&argv[1..]),
            other => out(127, "", format!("{other}: command not found")),
        };
        self.write_mountinfo(&state);
        Ok(result)
    }
}

/// A store with one package on disk, wired to a [`FakeSystem`].
pub struct Fixture {
    pub fake: Arc<FakeSystem>,
    pub root: TempDir,
    pub config: Config,
    pub target: OverlayTarget,
}

impl Fixture {
    /// `<root>/store/abc-pkg` overlaid from `<root>/overlay/abc-pkg`; paths
    /// are relative to the package dir.
    pub fn per_package() -> Self {
        let fake = FakeSystem::new();
        let root = tempfile::tempdir().unwrap();
        let lower = root.path().join("store/abc-pkg");
        fs::create_dir_all(&lower).unwrap();
        let base = root.path().join("overlay/abc-pkg");
        let dirs = resolve_dir_set(OverlayMode::PerPackage, &lower, &base).unwrap();
        let target = OverlayTarget::new("abc-pkg", dirs, lower).unwrap();
        let config = fake.config();
        Self {
            fake,
            root,
            config,
            target,
        }
    }

    /// `<root>/store` overlaid as a whole from `<root>/overlay-store`, with a
    /// rebuild command at `<root>/bin/nixos-rebuild`.
    pub fn whole_store() -> Self {
        let fake = FakeSystem::new();
        let root = tempfile::tempdir().unwrap();
        let lower = root.path().join("store");
        fs::create_dir_all(lower.join("abc-pkg")).unwrap();
        let base = root.path().join("overlay-store");
        let dirs = resolve_dir_set(OverlayMode::WholeStore, &lower, &base).unwrap();
        let target = OverlayTarget::new("store", dirs, lower).unwrap();

        let bin = root.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("nixos-rebuild"), "#!/bin/sh\necho rebuilding\n").unwrap();

        let mut config = fake.config();
        config.guard.rebuild_command = Some(bin.join("nixos-rebuild"));
        Self {
            fake,
            root,
            config,
            target,
        }
    }

    pub fn write_lower(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.target.tree_root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    pub fn write_candidate(&self, name: &str, content: &str) -> PathBuf {
        let dir = self.root.path().join("candidates");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    pub fn manager(&self) -> Arc<OverlayManager> {
        let runner: Arc<dyn ProcessRunner> = Arc::<FakeSystem>::clone(&self.fake);
        Arc::new(OverlayManager::new(
            self.target.clone(),
            runner,
            &self.config,
            LogConfig::new(true),
        ))
    }

    pub fn engine(&self) -> DiffEngine {
        let runner: Arc<dyn ProcessRunner> = Arc::<FakeSystem>::clone(&self.fake);
        DiffEngine::new(self.manager(), runner, &self.config.commands)
    }
}
