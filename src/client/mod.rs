//! Client orchestration: enumerate → diff → apply.
//!
//! The client is single-threaded and blocking. It aborts only when connect or
//! enumeration fails; every per-item failure is reported through the listener
//! and the run continues. Dry-run suppresses all mutating calls but still
//! fires the listener as if the mutation had happened.

pub mod remote;

pub use remote::RemoteTree;

use crate::engine;
use crate::error::{Error, Result};
use crate::fs::{LocalTree, TreeSource, TreeTarget};
use crate::location::Location;
use crate::model::{PathFilter, SyncItem, SyncOptions, SyncStatus};
use crate::pool::{BufferPool, ConnectionPool, GrowingBufferPool};
use std::io::{Read, Write};
use tracing::{debug, info};

/// Progress and error hooks fired as the client works through the pair list.
#[allow(unused_variables)]
pub trait SyncListener {
    fn on_skip(&mut self, item: &SyncItem) {}
    fn on_create(&mut self, item: &SyncItem) {}
    fn on_update(&mut self, item: &SyncItem) {}
    fn on_delete(&mut self, path: &str) {}
    fn on_validate(&mut self, path: &str, passed: bool) {}
    /// Fired per copied buffer during a file transfer.
    fn on_progress(&mut self, path: &str, bytes: u64, total: u64) {}
    fn on_error(&mut self, path: &str, err: &Error) {}
}

/// Listener that ignores everything.
pub struct NullListener;

impl SyncListener for NullListener {}

/// Summary counts for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub validated: u64,
    pub in_sync: u64,
    pub failed: u64,
    pub bytes_copied: u64,
}

pub struct Client<'l> {
    opts: SyncOptions,
    listener: &'l mut dyn SyncListener,
}

impl<'l> Client<'l> {
    pub fn new(opts: SyncOptions, listener: &'l mut dyn SyncListener) -> Self {
        Self { opts, listener }
    }

    /// Converge `dest` onto `source`. Fatal errors: remote connect and
    /// enumeration of either side.
    pub fn sync(
        &mut self,
        source: &Location,
        dest: &Location,
        filter: &PathFilter,
    ) -> Result<SyncStats> {
        // A missing local destination is created, or treated as empty when a
        // dry run forbids creating it.
        let dest_missing = matches!(dest, Location::Local(path) if !path.exists());
        if let Location::Local(path) = dest {
            if dest_missing && !self.opts.dry_run {
                std::fs::create_dir_all(path)?;
            }
        }
        let source_pool = connection_pool(source)?;
        let dest_pool = connection_pool(dest)?;
        let mut src = Endpoint::open(source, source_pool.as_ref(), &self.opts)?;
        let mut dst = Endpoint::open(dest, dest_pool.as_ref(), &self.opts)?;

        let sender_items = TreeSource::enumerate(
            &mut src,
            self.opts.follow_symlinks,
            self.opts.checksum,
            filter,
        )?;
        let receiver_items = if dest_missing && self.opts.dry_run {
            Vec::new()
        } else {
            TreeTarget::enumerate(
                &mut dst,
                self.opts.follow_symlinks,
                self.opts.checksum,
                filter,
            )?
        };
        debug!(
            sender = sender_items.len(),
            receiver = receiver_items.len(),
            "listings complete"
        );

        let pairs = engine::merge(sender_items, receiver_items, &self.opts);
        let buffers = GrowingBufferPool::new();
        let mut stats = SyncStats::default();
        let mut deletions = Vec::new();

        for pair in &pairs {
            match pair.status() {
                SyncStatus::InSync => {
                    let item = pair.sender.as_ref().expect("in-sync pair has a sender");
                    stats.in_sync += 1;
                    self.listener.on_skip(item);
                }
                SyncStatus::Create => {
                    let item = pair.sender.as_ref().expect("create pair has a sender");
                    self.upsert(&mut src, &mut dst, &buffers, item, true, &mut stats);
                }
                SyncStatus::Update => {
                    let item = pair.sender.as_ref().expect("update pair has a sender");
                    self.upsert(&mut src, &mut dst, &buffers, item, false, &mut stats);
                }
                SyncStatus::Delete => {
                    // Only actionable under delete-extraneous.
                    if self.opts.delete_extraneous {
                        deletions.push(pair);
                    }
                }
                SyncStatus::TypeConflict => {
                    stats.failed += 1;
                    let err = Error::Validation {
                        path: pair.path().to_string(),
                        reason: "file and directory with the same path".to_string(),
                    };
                    self.listener.on_error(pair.path(), &err);
                }
            }
        }

        // Children sort after their parents; deleting in reverse removes them
        // first.
        for pair in deletions.iter().rev() {
            let path = pair.path();
            let result = if self.opts.dry_run {
                Ok(())
            } else {
                dst.delete(path, self.opts.follow_symlinks)
            };
            match result {
                Ok(()) => {
                    stats.deleted += 1;
                    self.listener.on_delete(path);
                }
                Err(e) => {
                    stats.failed += 1;
                    self.listener.on_error(path, &e);
                }
            }
        }

        info!(
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            validated = stats.validated,
            in_sync = stats.in_sync,
            failed = stats.failed,
            bytes = stats.bytes_copied,
            "sync complete"
        );
        Ok(stats)
    }

    fn upsert(
        &mut self,
        src: &mut Endpoint<'_>,
        dst: &mut Endpoint<'_>,
        buffers: &GrowingBufferPool,
        item: &SyncItem,
        is_create: bool,
        stats: &mut SyncStats,
    ) {
        let result = if item.is_dir() {
            if self.opts.dry_run {
                Ok(())
            } else if is_create {
                dst.create_dir(item)
            } else {
                dst.apply_metadata(item)
            }
        } else {
            self.transfer(src, dst, buffers, item, stats)
        };

        match result {
            Ok(()) => {
                if is_create {
                    stats.created += 1;
                    self.listener.on_create(item);
                } else {
                    stats.updated += 1;
                    self.listener.on_update(item);
                }
                if item.is_file && !self.opts.dry_run {
                    stats.validated += 1;
                    self.listener.on_validate(&item.path, true);
                }
            }
            Err(e) => {
                stats.failed += 1;
                if matches!(e, Error::Validation { .. }) {
                    self.listener.on_validate(&item.path, false);
                }
                self.listener.on_error(&item.path, &e);
            }
        }
    }

    /// Copy one file and verify the result on the target.
    fn transfer(
        &mut self,
        src: &mut Endpoint<'_>,
        dst: &mut Endpoint<'_>,
        buffers: &GrowingBufferPool,
        item: &SyncItem,
        stats: &mut SyncStats,
    ) -> Result<()> {
        if self.opts.dry_run {
            return Ok(());
        }
        let mut reader = src.open_read(&item.path)?;
        let mut writer = dst.open_write(item)?;
        let mut lease = buffers.lease(self.opts.buffer_size);
        let mut copied = 0u64;
        loop {
            lease.clear();
            let n = lease.fill_from(self.opts.buffer_size, |space| reader.read(space))?;
            if n == 0 {
                break;
            }
            writer.write_all(lease.filled())?;
            copied += n as u64;
            self.listener.on_progress(&item.path, copied, item.size);
        }
        writer.flush()?;
        drop(writer);
        stats.bytes_copied += copied;

        dst.apply_metadata(item)?;
        match dst.validate(item, self.opts.checksum)? {
            None => Ok(()),
            Some(reason) => Err(Error::Validation {
                path: item.path.clone(),
                reason,
            }),
        }
    }
}

fn connection_pool(location: &Location) -> Result<Option<ConnectionPool>> {
    if location.is_remote() {
        Ok(Some(ConnectionPool::new(location.socket_addr()?)))
    } else {
        Ok(None)
    }
}

/// Either side of a sync, local or remote, behind the same traits.
enum Endpoint<'p> {
    Local(LocalTree),
    Remote(RemoteTree<'p>),
}

impl<'p> Endpoint<'p> {
    fn open(
        location: &Location,
        pool: Option<&'p ConnectionPool>,
        opts: &SyncOptions,
    ) -> Result<Self> {
        match location {
            Location::Local(path) => Ok(Endpoint::Local(LocalTree::new(path))),
            Location::Remote { path, .. } => {
                let pool = pool.expect("remote endpoint without a connection pool");
                Ok(Endpoint::Remote(RemoteTree::connect(
                    pool,
                    path,
                    opts.buffer_size,
                )?))
            }
        }
    }
}

impl TreeSource for Endpoint<'_> {
    fn enumerate(
        &mut self,
        follow_symlinks: bool,
        checksum: bool,
        filter: &PathFilter,
    ) -> Result<Vec<SyncItem>> {
        match self {
            Endpoint::Local(t) => TreeSource::enumerate(t, follow_symlinks, checksum, filter),
            Endpoint::Remote(t) => TreeSource::enumerate(t, follow_symlinks, checksum, filter),
        }
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>> {
        match self {
            Endpoint::Local(t) => t.open_read(path),
            Endpoint::Remote(t) => t.open_read(path),
        }
    }
}

impl TreeTarget for Endpoint<'_> {
    fn enumerate(
        &mut self,
        follow_symlinks: bool,
        checksum: bool,
        filter: &PathFilter,
    ) -> Result<Vec<SyncItem>> {
        match self {
            Endpoint::Local(t) => TreeTarget::enumerate(t, follow_symlinks, checksum, filter),
            Endpoint::Remote(t) => TreeTarget::enumerate(t, follow_symlinks, checksum, filter),
        }
    }

    fn create_dir(&mut self, item: &SyncItem) -> Result<()> {
        match self {
            Endpoint::Local(t) => t.create_dir(item),
            Endpoint::Remote(t) => t.create_dir(item),
        }
    }

    fn delete(&mut self, path: &str, follow_symlinks: bool) -> Result<()> {
        match self {
            Endpoint::Local(t) => t.delete(path, follow_symlinks),
            Endpoint::Remote(t) => t.delete(path, follow_symlinks),
        }
    }

    fn apply_metadata(&mut self, item: &SyncItem) -> Result<()> {
        match self {
            Endpoint::Local(t) => t.apply_metadata(item),
            Endpoint::Remote(t) => t.apply_metadata(item),
        }
    }

    fn validate(&mut self, item: &SyncItem, with_checksum: bool) -> Result<Option<String>> {
        match self {
            Endpoint::Local(t) => t.validate(item, with_checksum),
            Endpoint::Remote(t) => t.validate(item, with_checksum),
        }
    }

    fn open_write(&mut self, item: &SyncItem) -> Result<Box<dyn std::io::Write + Send>> {
        match self {
            Endpoint::Local(t) => t.open_write(item),
            Endpoint::Remote(t) => t.open_write(item),
        }
    }
}
