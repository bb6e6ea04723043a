//! CommonJS module support.
//!
//! The [`Registry`] resolves `require` specifiers to files and packages,
//! caches what it reads and compiles, and installs the `require` function
//! into each new interpreter. Sources are read through a [`SourceFs`], which
//! defaults to the OS filesystem.

mod registry;
mod require;

pub use registry::{Manifest, Module, Registry};

use std::io;
use std::path::{Component, Path, PathBuf};

/// What a path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Read access to module sources.
pub trait SourceFs: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Kind of the entry at `path`. Missing entries are `NotFound` errors.
    fn entry_kind(&self, path: &Path) -> io::Result<EntryKind>;
}

/// The operating system filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

impl SourceFs for OsFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn entry_kind(&self, path: &Path) -> io::Result<EntryKind> {
        let metadata = std::fs::metadata(path)?;
        Ok(if metadata.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        })
    }
}

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component. Symlinks are not consulted.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        let cases = [
            ("/srv/scripts/./lib/../util.js", "/srv/scripts/util.js"),
            ("/srv/../../etc", "/etc"),
            ("a/b/../../..", ".."),
            ("./", "."),
            ("node_modules/pkg/./index.js", "node_modules/pkg/index.js"),
        ];
        for (input, expected) in cases {
            assert_eq!(clean_path(Path::new(input)), PathBuf::from(expected), "{input}");
        }
    }
}
