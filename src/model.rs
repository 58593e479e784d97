//! Metadata model for tree synchronization.
//!
//! `SyncItem` is one filesystem entry's metadata snapshot, `SyncPair` the
//! pairing of a sender item with the matching receiver item plus the derived
//! action, `SyncOptions` the policy knobs for a run.

/// Default transfer buffer size (4 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// One file or directory within a tree, keyed by its relative path.
///
/// Paths are '/'-separated and relative to the tree root; the root itself is
/// never represented. Size and mtime carry no meaning for directories and are
/// ignored by comparisons. A checksum is attached at most once, and only when
/// checksum mode asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncItem {
    /// Relative path, unique within one tree. Never empty.
    pub path: String,
    pub is_file: bool,
    /// Size in bytes. Meaningless for directories.
    pub size: u64,
    /// Last modification time, unix seconds. Meaningless for directories.
    pub mtime: i64,
    /// Unix permission bits, when available.
    pub perms: Option<u32>,
    /// Owner name + uid, when available.
    pub owner: Option<(String, u32)>,
    /// Group name + gid, when available.
    pub group: Option<(String, u32)>,
    /// Content digest, present only after explicit computation.
    pub checksum: Option<String>,
}

impl SyncItem {
    pub fn file(path: impl Into<String>, size: u64, mtime: i64) -> Self {
        let path = path.into();
        debug_assert!(!path.is_empty(), "relative path must not be empty");
        Self {
            path,
            is_file: true,
            size,
            mtime,
            perms: None,
            owner: None,
            group: None,
            checksum: None,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        let path = path.into();
        debug_assert!(!path.is_empty(), "relative path must not be empty");
        Self {
            path,
            is_file: false,
            size: 0,
            mtime: 0,
            perms: None,
            owner: None,
            group: None,
            checksum: None,
        }
    }

    pub fn with_perms(mut self, perms: u32) -> Self {
        self.perms = Some(perms);
        self
    }

    /// Attach a content digest. Items are otherwise immutable after creation.
    pub fn set_checksum(&mut self, checksum: impl Into<String>) {
        debug_assert!(self.is_file, "checksums apply to files only");
        self.checksum = Some(checksum.into());
    }

    pub fn is_dir(&self) -> bool {
        !self.is_file
    }
}

/// Derived action for one relative path across both trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Present on both sides, no difference detected.
    InSync,
    /// Present on both sides, content or metadata differs.
    Update,
    /// Present only on the sender.
    Create,
    /// Present only on the receiver. Actionable only with delete-extraneous.
    Delete,
    /// File on one side, directory on the other. Never silently resolved.
    TypeConflict,
}

/// Sender/receiver pairing under one relative path.
///
/// At least one side is always present. The status is derived on
/// construction and must be rederived if either item is replaced.
#[derive(Debug, Clone)]
pub struct SyncPair {
    pub sender: Option<SyncItem>,
    pub receiver: Option<SyncItem>,
    status: SyncStatus,
}

impl SyncPair {
    pub fn new(sender: Option<SyncItem>, receiver: Option<SyncItem>, opts: &SyncOptions) -> Self {
        assert!(
            sender.is_some() || receiver.is_some(),
            "a sync pair needs at least one side"
        );
        let status = derive_status(sender.as_ref(), receiver.as_ref(), opts);
        Self {
            sender,
            receiver,
            status,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Recompute the derived status after replacing either item.
    pub fn rederive(&mut self, opts: &SyncOptions) {
        self.status = derive_status(self.sender.as_ref(), self.receiver.as_ref(), opts);
    }

    /// The relative path shared by both sides.
    pub fn path(&self) -> &str {
        self.sender
            .as_ref()
            .or(self.receiver.as_ref())
            .map(|i| i.path.as_str())
            .expect("invariant: at least one side present")
    }
}

fn derive_status(
    sender: Option<&SyncItem>,
    receiver: Option<&SyncItem>,
    opts: &SyncOptions,
) -> SyncStatus {
    match (sender, receiver) {
        (Some(s), Some(r)) => {
            if s.is_file != r.is_file {
                SyncStatus::TypeConflict
            } else if items_differ(s, r, opts) {
                SyncStatus::Update
            } else {
                SyncStatus::InSync
            }
        }
        (Some(_), None) => SyncStatus::Create,
        (None, Some(_)) => SyncStatus::Delete,
        (None, None) => unreachable!("checked in SyncPair::new"),
    }
}

fn items_differ(s: &SyncItem, r: &SyncItem, opts: &SyncOptions) -> bool {
    if s.is_file {
        if s.size != r.size || s.mtime != r.mtime {
            return true;
        }
        // Checksum is only consulted when the mode asked for it; a side that
        // failed to produce one counts as differing.
        if opts.checksum {
            return match (&s.checksum, &r.checksum) {
                (Some(a), Some(b)) => a != b,
                _ => true,
            };
        }
        false
    } else {
        // Directories differ on metadata only, never on content.
        s.perms != r.perms || s.owner != r.owner || s.group != r.group
    }
}

/// Glob patterns excluding paths from enumeration.
///
/// Patterns travel over the wire as raw strings; whichever side enumerates
/// compiles and applies them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter {
    pub excludes: Vec<String>,
}

impl PathFilter {
    pub fn new(excludes: Vec<String>) -> Self {
        Self { excludes }
    }

    pub fn is_empty(&self) -> bool {
        self.excludes.is_empty()
    }
}

/// Synchronization policy for one run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Delete receiver entries that have no sender counterpart.
    pub delete_extraneous: bool,
    /// Suppress all mutating operations, still reporting them.
    pub dry_run: bool,
    pub follow_symlinks: bool,
    /// Compute and compare content digests.
    pub checksum: bool,
    /// Transfer buffer size in bytes. Always positive.
    pub buffer_size: usize,
}

impl SyncOptions {
    /// Returns `None` when `buffer_size` is zero.
    pub fn new(
        delete_extraneous: bool,
        dry_run: bool,
        follow_symlinks: bool,
        checksum: bool,
        buffer_size: usize,
    ) -> Option<Self> {
        if buffer_size == 0 {
            return None;
        }
        Some(Self {
            delete_extraneous,
            dry_run,
            follow_symlinks,
            checksum,
            buffer_size,
        })
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            delete_extraneous: false,
            dry_run: false,
            follow_symlinks: false,
            checksum: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_create_and_delete() {
        let opts = SyncOptions::default();
        let pair = SyncPair::new(Some(SyncItem::file("a.txt", 10, 100)), None, &opts);
        assert_eq!(pair.status(), SyncStatus::Create);

        let pair = SyncPair::new(None, Some(SyncItem::file("a.txt", 10, 100)), &opts);
        assert_eq!(pair.status(), SyncStatus::Delete);
    }

    #[test]
    fn test_status_in_sync_and_update() {
        let opts = SyncOptions::default();
        let pair = SyncPair::new(
            Some(SyncItem::file("a.txt", 10, 100)),
            Some(SyncItem::file("a.txt", 10, 100)),
            &opts,
        );
        assert_eq!(pair.status(), SyncStatus::InSync);

        let pair = SyncPair::new(
            Some(SyncItem::file("a.txt", 11, 100)),
            Some(SyncItem::file("a.txt", 10, 100)),
            &opts,
        );
        assert_eq!(pair.status(), SyncStatus::Update);

        let pair = SyncPair::new(
            Some(SyncItem::file("a.txt", 10, 101)),
            Some(SyncItem::file("a.txt", 10, 100)),
            &opts,
        );
        assert_eq!(pair.status(), SyncStatus::Update);
    }

    #[test]
    fn test_status_type_conflict() {
        let opts = SyncOptions::default();
        let pair = SyncPair::new(
            Some(SyncItem::file("x", 1, 1)),
            Some(SyncItem::dir("x")),
            &opts,
        );
        assert_eq!(pair.status(), SyncStatus::TypeConflict);
    }

    #[test]
    fn test_checksum_consulted_only_in_checksum_mode() {
        let mut opts = SyncOptions::default();
        let mut s = SyncItem::file("a.txt", 10, 100);
        let mut r = SyncItem::file("a.txt", 10, 100);
        s.set_checksum("aaaa");
        r.set_checksum("bbbb");

        let pair = SyncPair::new(Some(s.clone()), Some(r.clone()), &opts);
        assert_eq!(pair.status(), SyncStatus::InSync);

        opts.checksum = true;
        let pair = SyncPair::new(Some(s.clone()), Some(r.clone()), &opts);
        assert_eq!(pair.status(), SyncStatus::Update);

        r.checksum = s.checksum.clone();
        let pair = SyncPair::new(Some(s), Some(r), &opts);
        assert_eq!(pair.status(), SyncStatus::InSync);
    }

    #[test]
    fn test_checksum_mode_with_missing_digest_differs() {
        let mut opts = SyncOptions::default();
        opts.checksum = true;
        let mut s = SyncItem::file("a.txt", 10, 100);
        s.set_checksum("aaaa");
        let r = SyncItem::file("a.txt", 10, 100);

        let pair = SyncPair::new(Some(s), Some(r), &opts);
        assert_eq!(pair.status(), SyncStatus::Update);
    }

    #[test]
    fn test_dir_differs_on_metadata_only() {
        let opts = SyncOptions::default();
        let pair = SyncPair::new(
            Some(SyncItem::dir("d").with_perms(0o755)),
            Some(SyncItem::dir("d").with_perms(0o700)),
            &opts,
        );
        assert_eq!(pair.status(), SyncStatus::Update);

        let pair = SyncPair::new(
            Some(SyncItem::dir("d").with_perms(0o755)),
            Some(SyncItem::dir("d").with_perms(0o755)),
            &opts,
        );
        assert_eq!(pair.status(), SyncStatus::InSync);
    }

    #[test]
    fn test_rederive_after_item_change() {
        let opts = SyncOptions::default();
        let mut pair = SyncPair::new(
            Some(SyncItem::file("a", 10, 100)),
            Some(SyncItem::file("a", 10, 100)),
            &opts,
        );
        assert_eq!(pair.status(), SyncStatus::InSync);

        pair.receiver = Some(SyncItem::file("a", 12, 100));
        pair.rederive(&opts);
        assert_eq!(pair.status(), SyncStatus::Update);
    }

    #[test]
    fn test_options_reject_zero_buffer() {
        assert!(SyncOptions::new(false, false, false, false, 0).is_none());
        let opts = SyncOptions::new(true, false, false, false, 1024).unwrap();
        assert!(opts.delete_extraneous);
        assert_eq!(opts.buffer_size, 1024);
    }
}
