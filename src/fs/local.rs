//! Local filesystem collaborator.
//!
//! Walks with the `ignore` crate, extracts unix permissions and ownership,
//! applies mtimes with `filetime`. The content digest function is pluggable;
//! the default is a BLAKE3 hex digest.

use crate::error::{Error, Result};
use crate::fs::{clean_relative, TreeSource, TreeTarget};
use crate::model::{PathFilter, SyncItem};
use ignore::WalkBuilder;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Content digest function. Only the integration point is fixed; the
/// algorithm is whatever the caller plugs in.
pub type Checksummer = fn(&Path) -> std::io::Result<String>;

/// BLAKE3 hex digest of a file's content, the default checksummer.
pub fn blake3_checksum(path: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// A directory tree on the local filesystem, addressed by relative paths.
pub struct LocalTree {
    root: PathBuf,
    checksummer: Checksummer,
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            checksummer: blake3_checksum,
        }
    }

    pub fn with_checksummer(mut self, checksummer: Checksummer) -> Self {
        self.checksummer = checksummer;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checksum(&self, path: &str) -> Result<String> {
        Ok((self.checksummer)(&self.full_path(path)?)?)
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(clean_relative(path)?))
    }

    fn scan(
        &self,
        follow_symlinks: bool,
        checksum: bool,
        filter: &PathFilter,
    ) -> Result<Vec<SyncItem>> {
        let patterns = compile_filter(filter)?;
        let mut owners = OwnerCache::default();
        let mut items = Vec::new();

        let walk = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .follow_links(follow_symlinks)
            .build();

        for entry in walk {
            let entry = entry.map_err(|e| Error::Enumerate(self.root.clone(), e.to_string()))?;
            if entry.depth() == 0 {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| Error::Enumerate(self.root.clone(), e.to_string()))?;
            let rel = rel.to_string_lossy().replace('\\', "/");

            if patterns.iter().any(|p| p.matches(&rel)) {
                trace!(path = %rel, "excluded by filter");
                continue;
            }

            let file_type = entry.file_type().ok_or_else(|| {
                Error::Enumerate(self.root.clone(), format!("no file type for {rel}"))
            })?;
            if file_type.is_symlink() {
                // Not following: the link itself is not replicated.
                trace!(path = %rel, "skipping symlink");
                continue;
            }

            let md = entry
                .metadata()
                .map_err(|e| Error::Enumerate(self.root.clone(), e.to_string()))?;
            let mut item = if md.is_dir() {
                SyncItem::dir(rel)
            } else {
                SyncItem::file(rel, md.len(), mtime_of(&md))
            };
            attach_unix_metadata(&mut item, &md, &mut owners);

            if checksum && item.is_file {
                let digest = (self.checksummer)(entry.path())
                    .map_err(|e| Error::Enumerate(self.root.clone(), e.to_string()))?;
                item.set_checksum(digest);
            }
            items.push(item);
        }

        debug!(root = %self.root.display(), count = items.len(), "enumerated tree");
        Ok(items)
    }
}

fn compile_filter(filter: &PathFilter) -> Result<Vec<glob::Pattern>> {
    filter
        .excludes
        .iter()
        .map(|pattern| {
            glob::Pattern::new(pattern)
                .map_err(|e| Error::Config(format!("bad exclude pattern {pattern:?}: {e}")))
        })
        .collect()
}

fn mtime_of(md: &fs::Metadata) -> i64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        md.mtime()
    }
    #[cfg(not(unix))]
    {
        md.modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[cfg(unix)]
fn attach_unix_metadata(item: &mut SyncItem, md: &fs::Metadata, owners: &mut OwnerCache) {
    use std::os::unix::fs::MetadataExt;
    item.perms = Some(md.mode() & 0o7777);
    item.owner = Some((owners.user(md.uid()), md.uid()));
    item.group = Some((owners.group(md.gid()), md.gid()));
}

#[cfg(not(unix))]
fn attach_unix_metadata(_item: &mut SyncItem, _md: &fs::Metadata, _owners: &mut OwnerCache) {}

/// uid/gid → name lookups, cached for the duration of one scan.
#[derive(Default)]
struct OwnerCache {
    #[cfg(unix)]
    users: std::collections::HashMap<u32, String>,
    #[cfg(unix)]
    groups: std::collections::HashMap<u32, String>,
}

#[cfg(unix)]
impl OwnerCache {
    fn user(&mut self, uid: u32) -> String {
        self.users
            .entry(uid)
            .or_insert_with(|| lookup_user(uid).unwrap_or_default())
            .clone()
    }

    fn group(&mut self, gid: u32) -> String {
        self.groups
            .entry(gid)
            .or_insert_with(|| lookup_group(gid).unwrap_or_default())
            .clone()
    }
}

#[cfg(unix)]
fn lookup_user(uid: u32) -> Option<String> {
    let mut buf = vec![0u8; 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(unix)]
fn lookup_group(gid: u32) -> Option<String> {
    let mut buf = vec![0u8; 1024];
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe {
        libc::getgrgid_r(
            gid,
            &mut grp,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(grp.gr_name) };
    Some(name.to_string_lossy().into_owned())
}

impl TreeSource for LocalTree {
    fn enumerate(
        &mut self,
        follow_symlinks: bool,
        checksum: bool,
        filter: &PathFilter,
    ) -> Result<Vec<SyncItem>> {
        self.scan(follow_symlinks, checksum, filter)
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.full_path(path)?)?))
    }
}

impl TreeTarget for LocalTree {
    fn enumerate(
        &mut self,
        follow_symlinks: bool,
        checksum: bool,
        filter: &PathFilter,
    ) -> Result<Vec<SyncItem>> {
        self.scan(follow_symlinks, checksum, filter)
    }

    fn create_dir(&mut self, item: &SyncItem) -> Result<()> {
        let path = self.full_path(&item.path)?;
        fs::create_dir_all(&path)?;
        apply_perms(&path, item)?;
        Ok(())
    }

    fn delete(&mut self, path: &str, _follow_symlinks: bool) -> Result<()> {
        let path = self.full_path(path)?;
        let md = fs::symlink_metadata(&path)?;
        if md.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn apply_metadata(&mut self, item: &SyncItem) -> Result<()> {
        let path = self.full_path(&item.path)?;
        apply_perms(&path, item)?;
        if item.is_file {
            filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(item.mtime, 0))?;
        }
        apply_ownership(&path, item)?;
        Ok(())
    }

    fn validate(&mut self, item: &SyncItem, with_checksum: bool) -> Result<Option<String>> {
        let path = self.full_path(&item.path)?;
        let md = match fs::metadata(&path) {
            Ok(md) => md,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Some("entry does not exist".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if md.is_dir() == item.is_file {
            return Ok(Some(format!(
                "expected a {}, found a {}",
                if item.is_file { "file" } else { "directory" },
                if md.is_dir() { "directory" } else { "file" },
            )));
        }
        if item.is_file && md.len() != item.size {
            return Ok(Some(format!(
                "size mismatch: expected {}, found {}",
                item.size,
                md.len()
            )));
        }
        if with_checksum && item.is_file {
            let digest = (self.checksummer)(&path)?;
            match &item.checksum {
                Some(want) if *want != digest => {
                    return Ok(Some(format!(
                        "checksum mismatch: expected {want}, found {digest}"
                    )))
                }
                None => return Ok(Some("no checksum to validate against".to_string())),
                _ => {}
            }
        }
        Ok(None)
    }

    fn open_write(&mut self, item: &SyncItem) -> Result<Box<dyn Write + Send>> {
        let path = self.full_path(&item.path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(File::create(&path)?))
    }
}

fn apply_perms(path: &Path, item: &SyncItem) -> Result<()> {
    #[cfg(unix)]
    if let Some(mode) = item.perms {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = (path, item);
    Ok(())
}

/// Ownership can only be applied by root; otherwise it is carried as
/// metadata but not written back.
fn apply_ownership(path: &Path, item: &SyncItem) -> Result<()> {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } == 0 {
            let uid = item.owner.as_ref().map(|(_, id)| *id);
            let gid = item.group.as_ref().map(|(_, id)| *id);
            if uid.is_some() || gid.is_some() {
                std::os::unix::fs::chown(path, uid, gid)?;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (path, item);
    Ok(())
}
