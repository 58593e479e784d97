//! Per-connection protocol state.

use crate::codec::ByteBuffer;
use crate::fs::LocalTree;
use crate::model::SyncItem;
use crate::pool::{BufferPool, FixedBufferPool};
use crate::protocol::{ConnectionState, SyncCommand};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Destination file mid-transfer: opened by open-write, fed by write-chunk,
/// finalized when metadata is applied or the item is validated.
pub(crate) struct OpenFile {
    pub sink: Box<dyn Write + Send>,
    pub item: SyncItem,
}

/// State owned by exactly one thread at any moment: the dispatcher while the
/// connection is registered, a worker while readiness is being serviced.
pub(crate) struct Session {
    pub peer: SocketAddr,
    pub state: ConnectionState,
    pub last_command: Option<SyncCommand>,
    /// Tree the peer connected to; absent until a connect command.
    pub tree: Option<LocalTree>,
    pub open_file: Option<OpenFile>,
    last_activity: Instant,
    /// Request accumulation buffer, leased from the server's pool.
    inbuf: Option<ByteBuffer>,
    pool: Arc<FixedBufferPool>,
}

impl Session {
    pub fn new(peer: SocketAddr, pool: &Arc<FixedBufferPool>) -> Self {
        Self {
            peer,
            state: ConnectionState::AwaitingCommand,
            last_command: None,
            tree: None,
            open_file: None,
            last_activity: Instant::now(),
            inbuf: Some(pool.get(pool.default_size())),
            pool: Arc::clone(pool),
        }
    }

    pub fn buffer(&mut self) -> &mut ByteBuffer {
        self.inbuf.as_mut().expect("buffer released")
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Close and drop the open destination file, if any.
    pub fn close_open_file(&mut self) -> crate::error::Result<()> {
        if let Some(mut open) = self.open_file.take() {
            open.sink.flush()?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(buf) = self.inbuf.take() {
            self.pool.release(buf);
        }
    }
}
