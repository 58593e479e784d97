//! Remote trees over the wire protocol.
//!
//! `RemoteTree` speaks the framed protocol against a server through a pooled
//! connection and implements the same source/target traits as a local tree,
//! so the orchestration above never knows which side is remote. Requests on
//! one connection are strictly sequential: every request reads its response
//! before the next is sent.

use crate::codec::records::decode_item;
use crate::codec::{DataReader, SliceReader, StreamReader, StreamWriter};
use crate::error::{Error, Result};
use crate::fs::{TreeSource, TreeTarget};
use crate::model::{PathFilter, SyncItem};
use crate::pool::{ConnectionLease, ConnectionPool};
use crate::protocol::{
    encode_request, read_chunk_len, read_response, Request, ResponseBody, PROTOCOL_VERSION,
};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use tracing::debug;

/// One remote tree behind a connect handshake.
pub struct RemoteTree<'p> {
    lease: ConnectionLease<'p>,
    chunk_size: usize,
}

impl<'p> RemoteTree<'p> {
    /// Acquire a pooled connection and negotiate the protocol against the
    /// given tree root on the server.
    pub fn connect(pool: &'p ConnectionPool, root: &str, chunk_size: usize) -> Result<Self> {
        let lease = pool.acquire()?;
        let mut tree = Self { lease, chunk_size };
        let body = tree.request_fixed(&Request::Connect {
            version: PROTOCOL_VERSION,
            root: root.to_string(),
        })?;
        let mut r = SliceReader::new(&body);
        let version = r.read_i32()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "server speaks protocol {version}, expected {PROTOCOL_VERSION}"
            )));
        }
        debug!(addr = %pool.addr(), root, "connected to remote tree");
        Ok(tree)
    }

    fn send_request(&mut self, request: &Request) -> Result<()> {
        let mut w = StreamWriter::new(self.lease.stream());
        encode_request(&mut w, request)?;
        w.flush()
    }

    fn request_fixed(&mut self, request: &Request) -> Result<Vec<u8>> {
        self.send_request(request)?;
        let mut r = StreamReader::new(self.lease.stream());
        match read_response(&mut r)? {
            ResponseBody::Data(body) => Ok(body),
            ResponseBody::Chunked => Err(Error::protocol("unexpected chunked response")),
        }
    }

    /// Send a request whose response is a chunk stream; the caller consumes
    /// the chunks from the connection before issuing anything else.
    fn request_chunked(&mut self, request: &Request) -> Result<()> {
        self.send_request(request)?;
        let mut r = StreamReader::new(self.lease.stream());
        match read_response(&mut r)? {
            ResponseBody::Chunked => Ok(()),
            ResponseBody::Data(_) => Err(Error::protocol("expected a chunked response")),
        }
    }

    fn list(&mut self, request: Request) -> Result<Vec<SyncItem>> {
        self.request_chunked(&request)?;
        let mut items = Vec::new();
        let mut r = StreamReader::new(self.lease.stream());
        crate::protocol::for_each_chunk(&mut r, |chunk| {
            let mut cr = SliceReader::new(chunk);
            items.push(decode_item(&mut cr)?);
            Ok(())
        })?;
        Ok(items)
    }
}

impl TreeSource for RemoteTree<'_> {
    fn enumerate(
        &mut self,
        follow_symlinks: bool,
        checksum: bool,
        filter: &PathFilter,
    ) -> Result<Vec<SyncItem>> {
        self.list(Request::ListSender {
            follow_symlinks,
            checksum,
            filter: filter.clone(),
        })
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.request_chunked(&Request::OpenRead {
            path: path.to_string(),
        })?;
        let stream = self.lease.stream().try_clone()?;
        Ok(Box::new(ChunkReader::new(stream)))
    }
}

impl TreeTarget for RemoteTree<'_> {
    fn enumerate(
        &mut self,
        follow_symlinks: bool,
        checksum: bool,
        filter: &PathFilter,
    ) -> Result<Vec<SyncItem>> {
        self.list(Request::ListReceiver {
            follow_symlinks,
            checksum,
            filter: filter.clone(),
        })
    }

    fn create_dir(&mut self, item: &SyncItem) -> Result<()> {
        self.request_fixed(&Request::CreateDir { item: item.clone() })?;
        Ok(())
    }

    fn delete(&mut self, path: &str, follow_symlinks: bool) -> Result<()> {
        self.request_fixed(&Request::DeleteEntry {
            path: path.to_string(),
            follow_symlinks,
        })?;
        Ok(())
    }

    fn apply_metadata(&mut self, item: &SyncItem) -> Result<()> {
        self.request_fixed(&Request::SetDirMetadata { item: item.clone() })?;
        Ok(())
    }

    fn validate(&mut self, item: &SyncItem, with_checksum: bool) -> Result<Option<String>> {
        let body = self.request_fixed(&Request::Validate {
            item: item.clone(),
            with_checksum,
        })?;
        let mut r = SliceReader::new(&body);
        r.read_opt_string()
    }

    fn open_write(&mut self, item: &SyncItem) -> Result<Box<dyn Write + Send>> {
        self.request_fixed(&Request::OpenWrite { item: item.clone() })?;
        let stream = self.lease.stream().try_clone()?;
        Ok(Box::new(ChunkWriter::new(stream, self.chunk_size)))
    }
}

/// Byte source over a chunked response: pulls chunk frames lazily as the
/// caller reads.
struct ChunkReader {
    stream: TcpStream,
    current: Vec<u8>,
    pos: usize,
    done: bool,
}

impl ChunkReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            current: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    fn refill(&mut self) -> Result<()> {
        let mut r = StreamReader::new(&self.stream);
        match read_chunk_len(&mut r)? {
            Some(len) => {
                self.current = r.read_byte_vec(len)?;
                self.pos = 0;
            }
            None => self.done = true,
        }
        Ok(())
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos == self.current.len() {
            if self.done {
                return Ok(0);
            }
            self.refill()
                .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Byte sink issuing one write-chunk request per flushed buffer.
struct ChunkWriter {
    stream: TcpStream,
    buf: Vec<u8>,
    chunk_size: usize,
}

impl ChunkWriter {
    fn new(stream: TcpStream, chunk_size: usize) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(chunk_size.min(64 * 1024)),
            chunk_size,
        }
    }

    fn send_buffered(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buf);
        let mut w = StreamWriter::new(&self.stream);
        encode_request(&mut w, &Request::WriteChunk { data })?;
        w.flush()?;
        let mut r = StreamReader::new(&self.stream);
        match read_response(&mut r)? {
            ResponseBody::Data(_) => Ok(()),
            ResponseBody::Chunked => Err(Error::protocol("unexpected chunked response")),
        }
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.chunk_size {
            self.send_buffered()
                .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.send_buffered()
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        let _ = self.send_buffered();
    }
}
