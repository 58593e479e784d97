//! Filesystem collaborators: tree enumeration and mutation.
//!
//! `TreeSource` is the sender capability (enumerate, read files), `TreeTarget`
//! the receiver capability (enumerate, mutate, validate). [`LocalTree`]
//! implements both against a local directory; `client::remote::RemoteTree`
//! implements both over the wire protocol, so the client orchestration never
//! knows which side is remote.

pub mod local;

pub use local::LocalTree;

use crate::error::{Error, Result};
use crate::model::{PathFilter, SyncItem};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

/// Sender capability: where items and file content come from.
pub trait TreeSource {
    /// Complete metadata listing of the tree. Failure here is fatal to the
    /// run: a partial listing is unsafe to diff.
    fn enumerate(
        &mut self,
        follow_symlinks: bool,
        checksum: bool,
        filter: &PathFilter,
    ) -> Result<Vec<SyncItem>>;

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>>;
}

/// Receiver capability: the tree being converged onto the sender.
pub trait TreeTarget {
    fn enumerate(
        &mut self,
        follow_symlinks: bool,
        checksum: bool,
        filter: &PathFilter,
    ) -> Result<Vec<SyncItem>>;

    fn create_dir(&mut self, item: &SyncItem) -> Result<()>;

    /// Remove a file or directory tree. Symlinks are removed, never followed.
    fn delete(&mut self, path: &str, follow_symlinks: bool) -> Result<()>;

    /// Apply permission bits, mtime and (when privileged) ownership.
    fn apply_metadata(&mut self, item: &SyncItem) -> Result<()>;

    /// Check an item against the tree. `None` = pass, `Some(reason)` = fail.
    fn validate(&mut self, item: &SyncItem, with_checksum: bool) -> Result<Option<String>>;

    fn open_write(&mut self, item: &SyncItem) -> Result<Box<dyn Write + Send>>;
}

/// Validate a wire-supplied relative path before joining it onto a root.
///
/// Rejects empty paths, absolute paths and any `..`/`.` component, so a
/// remote peer cannot escape the tree it connected to.
pub fn clean_relative(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::protocol("empty relative path"));
    }
    let p = Path::new(path);
    for component in p.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(Error::protocol(format!(
                    "path {path:?} is not a clean relative path"
                )))
            }
        }
    }
    Ok(p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_relative_accepts_nested() {
        assert_eq!(
            clean_relative("a/b/c.txt").unwrap(),
            PathBuf::from("a/b/c.txt")
        );
    }

    #[test]
    fn test_clean_relative_rejects_escapes() {
        assert!(clean_relative("").is_err());
        assert!(clean_relative("/etc/passwd").is_err());
        assert!(clean_relative("../sibling").is_err());
        assert!(clean_relative("a/../../b").is_err());
        assert!(clean_relative("./a").is_err());
    }
}
