//! Snapshot a project directory into a mountable [`FileSystemTree`].

use crate::environment::{FileSystemNode, FileSystemTree};
use std::io;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// Names skipped wherever they appear in the tree.
pub const DEFAULT_IGNORE: &[&str] = &["node_modules", ".git", "pnpm-lock.yaml", "target", "dist"];

/// Read every file below `root` into a tree, skipping ignored names.
/// Files that are not valid UTF-8 are skipped with a warning.
pub fn snapshot_dir(root: &Path, ignore: &[&str]) -> io::Result<FileSystemTree> {
    let mut tree = FileSystemTree::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !ignore.iter().any(|ignored| *ignored == name)
        });

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let Some((name, parents)) = segments.split_last() else {
            continue;
        };

        let node = if entry.file_type().is_dir() {
            FileSystemNode::Directory(FileSystemTree::new())
        } else if entry.file_type().is_file() {
            match std::fs::read_to_string(entry.path()) {
                Ok(contents) => FileSystemNode::File { contents },
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!(path = ?entry.path(), "Skipping non UTF-8 file");
                    continue;
                }
                Err(e) => return Err(e),
            }
        } else {
            continue;
        };

        let Some(dir) = directory_at(&mut tree, parents) else {
            continue;
        };
        dir.insert(name.clone(), node);
    }
    Ok(tree)
}

fn directory_at<'a>(tree: &'a mut FileSystemTree, path: &[String]) -> Option<&'a mut FileSystemTree> {
    let mut current = tree;
    for segment in path {
        current = match current.get_mut(segment)? {
            FileSystemNode::Directory(children) => children,
            FileSystemNode::File { .. } => return None,
        };
    }
    Some(current)
}
