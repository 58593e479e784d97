//! Outbound connection pool.
//!
//! Reuses established TCP connections to one remote endpoint so the client
//! does not pay a connect handshake per request. Connections hand back to
//! the pool through an RAII lease.

use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts before a connect is reported as failed.
const CONNECT_ATTEMPTS: u32 = 10;

/// Sleep between connect attempts.
const CONNECT_BACKOFF: Duration = Duration::from_millis(50);

/// Per-attempt connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectionPool {
    addr: SocketAddr,
    idle: Mutex<Vec<TcpStream>>,
    closed: Mutex<bool>,
}

impl ConnectionPool {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            idle: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// An established connection: an idle pooled one when available, else a
    /// fresh connect, retried through transient non-readiness.
    pub fn acquire(&self) -> Result<ConnectionLease<'_>> {
        if *self.closed.lock().expect("pool lock") {
            return Err(Error::PoolClosed);
        }
        if let Some(stream) = self.idle.lock().expect("pool lock").pop() {
            return Ok(ConnectionLease {
                stream: Some(stream),
                pool: self,
            });
        }

        let stream = self.connect()?;
        Ok(ConnectionLease {
            stream: Some(stream),
            pool: self,
        })
    }

    fn connect(&self) -> Result<TcpStream> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(addr = %self.addr, attempt, "connection established");
                    return Ok(stream);
                }
                Err(e) if attempt < CONNECT_ATTEMPTS && is_transient(&e) => {
                    debug!(addr = %self.addr, attempt, error = %e, "connect not ready, retrying");
                    std::thread::sleep(CONNECT_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn release(&self, stream: TcpStream) {
        if *self.closed.lock().expect("pool lock") {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        self.idle.lock().expect("pool lock").push(stream);
    }

    /// Half-close both directions of every pooled connection and drop them.
    /// The pool refuses further `acquire` calls afterwards.
    pub fn close_all(&self) {
        *self.closed.lock().expect("pool lock") = true;
        let drained: Vec<_> = self.idle.lock().expect("pool lock").drain(..).collect();
        for stream in drained {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != ErrorKind::NotConnected {
                    warn!(addr = %self.addr, error = %e, "shutdown of pooled connection failed");
                }
            }
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

/// Connection leased from the pool; returns to it on drop.
///
/// `discard` drops the connection instead, for streams left in an
/// indeterminate protocol state after an error.
pub struct ConnectionLease<'a> {
    stream: Option<TcpStream>,
    pool: &'a ConnectionPool,
}

impl ConnectionLease<'_> {
    pub fn stream(&self) -> &TcpStream {
        self.stream.as_ref().expect("lease taken")
    }

    /// Drop the connection rather than pooling it.
    pub fn discard(mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.release(stream);
        }
    }
}
