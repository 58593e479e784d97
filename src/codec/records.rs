//! Composite record encoders.
//!
//! One encoder per record type, generic over the codec traits so the same
//! code serves every binding. Each encoding is a fixed field sequence and
//! idempotent: encode→decode→encode yields byte-identical output.

use crate::codec::{DataReader, DataWriter};
use crate::error::{Error, Result};
use crate::model::{PathFilter, SyncItem};

bitflags::bitflags! {
    /// Presence flags leading a SyncItem record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ItemFlags: u8 {
        const FILE = 1 << 0;
        const PERMS = 1 << 1;
        const OWNER = 1 << 2;
        const GROUP = 1 << 3;
        const CHECKSUM = 1 << 4;
    }
}

pub fn encode_item<W: DataWriter>(w: &mut W, item: &SyncItem) -> Result<()> {
    let mut flags = ItemFlags::empty();
    if item.is_file {
        flags |= ItemFlags::FILE;
    }
    if item.perms.is_some() {
        flags |= ItemFlags::PERMS;
    }
    if item.owner.is_some() {
        flags |= ItemFlags::OWNER;
    }
    if item.group.is_some() {
        flags |= ItemFlags::GROUP;
    }
    if item.checksum.is_some() {
        flags |= ItemFlags::CHECKSUM;
    }

    w.write_i8(flags.bits() as i8)?;
    w.write_string(&item.path)?;
    w.write_i64(item.size as i64)?;
    w.write_i64(item.mtime)?;
    if let Some(perms) = item.perms {
        w.write_i32(perms as i32)?;
    }
    if let Some((ref name, id)) = item.owner {
        w.write_string(name)?;
        w.write_i32(id as i32)?;
    }
    if let Some((ref name, id)) = item.group {
        w.write_string(name)?;
        w.write_i32(id as i32)?;
    }
    if let Some(ref checksum) = item.checksum {
        w.write_string(checksum)?;
    }
    Ok(())
}

pub fn decode_item<R: DataReader>(r: &mut R) -> Result<SyncItem> {
    let bits = r.read_i8()? as u8;
    let flags = ItemFlags::from_bits(bits)
        .ok_or_else(|| Error::protocol(format!("unknown item flags 0x{bits:02x}")))?;

    let path = r.read_string()?;
    if path.is_empty() {
        return Err(Error::protocol("empty relative path in item record"));
    }
    let size = r.read_i64()? as u64;
    let mtime = r.read_i64()?;

    let perms = if flags.contains(ItemFlags::PERMS) {
        Some(r.read_i32()? as u32)
    } else {
        None
    };
    let owner = if flags.contains(ItemFlags::OWNER) {
        Some((r.read_string()?, r.read_i32()? as u32))
    } else {
        None
    };
    let group = if flags.contains(ItemFlags::GROUP) {
        Some((r.read_string()?, r.read_i32()? as u32))
    } else {
        None
    };
    let checksum = if flags.contains(ItemFlags::CHECKSUM) {
        Some(r.read_string()?)
    } else {
        None
    };

    Ok(SyncItem {
        path,
        is_file: flags.contains(ItemFlags::FILE),
        size,
        mtime,
        perms,
        owner,
        group,
        checksum,
    })
}

/// Wire form of a server-side failure, carried in status-500 bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: i32,
    pub message: String,
    pub path: Option<String>,
}

impl ErrorRecord {
    pub fn from_error(err: &Error) -> Self {
        let path = match err {
            Error::Validation { path, .. } => Some(path.clone()),
            Error::Remote { path, .. } => path.clone(),
            _ => None,
        };
        Self {
            code: err.wire_code(),
            message: err.to_string(),
            path,
        }
    }

    pub fn into_error(self) -> Error {
        Error::Remote {
            code: self.code,
            message: self.message,
            path: self.path,
        }
    }
}

pub fn encode_error<W: DataWriter>(w: &mut W, record: &ErrorRecord) -> Result<()> {
    w.write_i32(record.code)?;
    w.write_string(&record.message)?;
    w.write_opt_string(record.path.as_deref())
}

pub fn decode_error<R: DataReader>(r: &mut R) -> Result<ErrorRecord> {
    Ok(ErrorRecord {
        code: r.read_i32()?,
        message: r.read_string()?,
        path: r.read_opt_string()?,
    })
}

pub fn encode_filter<W: DataWriter>(w: &mut W, filter: &PathFilter) -> Result<()> {
    w.write_i32(filter.excludes.len() as i32)?;
    for pattern in &filter.excludes {
        w.write_string(pattern)?;
    }
    Ok(())
}

pub fn decode_filter<R: DataReader>(r: &mut R) -> Result<PathFilter> {
    let count = r.read_i32()?;
    if count < 0 {
        return Err(Error::protocol(format!("negative filter count {count}")));
    }
    let mut excludes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        excludes.push(r.read_string()?);
    }
    Ok(PathFilter::new(excludes))
}
