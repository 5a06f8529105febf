mod review;
use crate::channel::configured_targets;
use crate::config::Config;
use crate::error::Result;
use crate::listing::{self, Tree};
use crate::logging::LogConfig;
use crate::mount::MountState;
use crate::overlay::{OverlayManager, OverlayMode};
use crate::patch::{Candidate, DiffBase, DiffEngine};
use crate::process::{ProcessRunner, SystemRunner};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(version, about = "Patch a read-only Nix store through an overlay")]
pub struct Cli {
    /// Log every filesystem and mount operation
    #[clap(long, short, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to /etc/overstore.toml when present)
    #[clap(long, global = true, env = "OVERSTORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overlay the whole store instead of the channel packages
    #[clap(long, global = true)]
    pub whole_store: bool,

    /// Only act on this channel (overrides `channels.include`)
    #[clap(long, global = true, conflicts_with = "whole_store")]
    pub channel: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mount the overlay
    #[clap(name = "start", aliases = &["on"])]
    Start,

    /// Unmount the overlay
    #[clap(name = "stop", aliases = &["off"])]
    Stop,

    /// Show whether the overlay (and the lower bind mount) are active
    #[clap(name = "status", aliases = &["st"])]
    Status,

    /// Compare a store file with a candidate, or show what the overlay
    /// changes about it
    #[clap(name = "diff", aliases = &["d"])]
    Diff {
        /// Path relative to the package tree
        #[clap(value_parser)]
        lower_path: PathBuf,

        /// Candidate file; without it the lower and merged views are compared
        #[clap(value_parser)]
        candidate: Option<PathBuf>,

        /// Name shown for the candidate in the diff header
        #[clap(long, requires = "candidate")]
        label: Option<String>,

        /// Compare against the merged view instead of the original
        #[clap(long, requires = "candidate")]
        merged: bool,
    },

    /// Replace a store file through the overlay
    #[clap(name = "patch", aliases = &["p"])]
    Patch {
        /// Path relative to the package tree
        #[clap(value_parser)]
        lower_path: PathBuf,

        /// File with the new content
        #[clap(value_parser)]
        candidate: PathBuf,
    },

    /// List files in the package tree
    #[clap(name = "list", aliases = &["ls", "l"])]
    List {
        /// Directory relative to the package tree
        #[clap(value_parser, default_value = "")]
        path: String,

        /// How many levels to descend
        #[clap(long)]
        depth: Option<usize>,
    },

    /// Compare a batch of downloaded files against the store
    #[clap(name = "review", aliases = &["r"])]
    Review(review::ReviewArgs),
}

const fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

/// Per-package targets have no bind mount and always report `bind off`.
fn status_lines(state: MountState) -> String {
    format!(
        "overlay {}\nbind {}\n",
        on_off(state.union()),
        on_off(state.bind())
    )
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let log = LogConfig::new(self.verbose);
        let mut config = Config::load(self.config.as_deref())?;
        let mode = if self.whole_store {
            OverlayMode::WholeStore
        } else {
            config.overlay.mode
        };
        if let Some(channel) = self.channel {
            config.channels.include = vec![channel];
        }

        let targets = configured_targets(&config, mode)?;
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemRunner::new(log));
        let multiple = targets.len() > 1;
        tracing::trace!("Running command: {:?}", self.command);

        for target in targets {
            if multiple {
                println!("[{}]", target.name);
            }
            let manager = Arc::new(OverlayManager::new(
                target,
                Arc::clone(&runner),
                &config,
                log,
            ));
            self.command.execute(manager, &runner, &config)?;
        }
        Ok(())
    }
}

impl Commands {
    fn execute(
        &self,
        manager: Arc<OverlayManager>,
        runner: &Arc<dyn ProcessRunner>,
        config: &Config,
    ) -> Result<()> {
        let engine = || DiffEngine::new(Arc::clone(&manager), Arc::clone(runner), &config.commands);
        match self {
            Commands::Start => {
                manager.start()?;
                Ok(())
            }
            Commands::Stop => {
                manager.stop()?;
                Ok(())
            }
            Commands::Status => {
                print!("{}", status_lines(manager.status()?));
                Ok(())
            }
            Commands::Diff {
                lower_path,
                candidate,
                label,
                merged,
            } => {
                let candidate = candidate.as_ref().map(|path| Candidate {
                    path: path.clone(),
                    label: label.clone(),
                });
                let outcome = match &candidate {
                    Some(candidate) if *merged => {
                        engine().diff_against(lower_path, candidate, DiffBase::Merged)?
                    }
                    _ => engine().diff(lower_path, candidate.as_ref())?,
                };
                print!("{}", outcome.unified_diff);
                Ok(())
            }
            Commands::Patch {
                lower_path,
                candidate,
            } => {
                let upper = engine().patch(lower_path, candidate)?;
                println!("{}", upper.display());
                Ok(())
            }
            Commands::List { path, depth } => {
                let dir = manager
                    .target()
                    .view_path(&listing::sanitize_listing_path(path));
                let depth = depth.unwrap_or(config.listing.max_depth);
                print!("{}", Tree(&listing::find_files(&dir, depth)));
                Ok(())
            }
            Commands::Review(args) => args.execute(Arc::new(engine())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diff_with_candidate() {
        let cli = Cli::parse_from([
            "overstore",
            "--verbose",
            "diff",
            "lib/default.nix",
            "/tmp/new.nix",
            "--label",
            "upstream",
            "--merged",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Diff {
                lower_path,
                candidate,
                label,
                merged,
            } => {
                assert_eq!(lower_path, PathBuf::from("lib/default.nix"));
                assert_eq!(candidate, Some(PathBuf::from("/tmp/new.nix")));
                assert_eq!(label.as_deref(), Some("upstream"));
                assert!(merged);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_merged_requires_candidate() {
        assert!(Cli::try_parse_from(["overstore", "diff", "a.nix", "--merged"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["overstore", "status", "--whole-store"]);
        assert!(cli.whole_store);
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_missing_command_is_an_error() {
        assert!(Cli::try_parse_from(["overstore"]).is_err());
        assert!(Cli::try_parse_from(["overstore", "serve"]).is_err());
    }

    #[test]
    fn test_status_prints_both_lines() {
        assert_eq!(status_lines(MountState::Inactive), "overlay off\nbind off\n");
        assert_eq!(status_lines(MountState::ActiveUnion), "overlay on\nbind off\n");
        assert_eq!(status_lines(MountState::ActiveBoth), "overlay on\nbind on\n");
    }

    #[test]
    fn test_list_defaults() {
        let cli = Cli::parse_from(["overstore", "ls"]);
        match cli.command {
            Commands::List { path, depth } => {
                assert!(path.is_empty());
                assert_eq!(depth, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
