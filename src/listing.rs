//! Bounded-depth listing of a package tree.
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    Dir,
    File,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileNode {
    pub depth: usize,
    pub kind: FileKind,
    pub name: String,
    /// `None` for files, symlinks and directories past the depth bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<PathBuf>,
}

fn sort_nodes(nodes: &mut [FileNode]) {
    nodes.sort_by(|a, b| (a.kind != FileKind::Dir, &a.name).cmp(&(b.kind != FileKind::Dir, &b.name)));
}

fn close_frame(stack: &mut Vec<Vec<FileNode>>) {
    let Some(mut children) = stack.pop() else {
        return;
    };
    sort_nodes(&mut children);
    if let Some(parent) = stack.last_mut().and_then(|frame| frame.last_mut()) {
        parent.children = Some(children);
    }
}

/// List `dir` down to `max_depth` levels. Entries at depth `d` are
/// directories with children only while `d + 1 < max_depth`; symlinks are
/// reported with their target and never followed. A missing directory lists
/// as empty.
#[tracing::instrument(level = "debug")]
pub fn find_files(dir: &Path, max_depth: usize) -> Vec<FileNode> {
    if !dir.is_dir() {
        tracing::debug!("not a directory: {}", dir.display());
        return Vec::new();
    }
    let max_depth = max_depth.max(1);

    let walker = jwalk::WalkDir::new(dir)
        .follow_links(false)
        .skip_hidden(false)
        .sort(true)
        .min_depth(1)
        .max_depth(max_depth);

    let mut stack: Vec<Vec<FileNode>> = vec![Vec::new()];
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("skipping unreadable entry: {e}");
                continue;
            }
        };
        let depth = entry.depth - 1;
        while stack.len() > depth + 1 {
            close_frame(&mut stack);
        }

        let file_type = entry.file_type;
        let (kind, link_target) = if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())
                .inspect_err(|e| tracing::debug!("readlink {}: {e}", entry.path().display()))
                .ok();
            (FileKind::Symlink, target)
        } else if file_type.is_dir() {
            (FileKind::Dir, None)
        } else {
            (FileKind::File, None)
        };
        let descend = kind == FileKind::Dir && depth + 1 < max_depth;

        let Some(frame) = stack.last_mut() else {
            break;
        };
        frame.push(FileNode {
            depth,
            kind,
            name: entry.file_name.to_string_lossy().into_owned(),
            children: None,
            link_target,
        });
        if descend {
            stack.push(Vec::new());
        }
    }
    while stack.len() > 1 {
        close_frame(&mut stack);
    }

    let mut top = stack.pop().unwrap_or_default();
    sort_nodes(&mut top);
    top
}

/// Turn a user-supplied listing path into one relative to the tree root.
/// Leading slashes and `..` segments are dropped.
pub fn sanitize_listing_path(requested: &str) -> PathBuf {
    Path::new(requested)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Indented text rendering, one entry per line.
pub struct Tree<'a>(pub &'a [FileNode]);

impl fmt::Display for Tree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in self.0 {
            let indent = "  ".repeat(node.depth);
            match (&node.kind, &node.link_target) {
                (FileKind::Dir, _) => writeln!(f, "{indent}{}/", node.name)?,
                (FileKind::Symlink, Some(target)) => {
                    writeln!(f, "{indent}{} -> {}", node.name, target.display())?;
                }
                _ => writeln!(f, "{indent}{}", node.name)?,
            }
            if let Some(children) = &node.children {
                write!(f, "{}", Tree(children))?;
            }
        }
        Ok(())
    }
}
