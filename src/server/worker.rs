//! Worker pool: executes per-connection read/decode/handle/write off the
//! dispatcher threads.
//!
//! A worker owns exactly one connection at a time and never touches another;
//! the connection's readiness interest stays disabled until the worker hands
//! it back. Blocking here is bounded by the single socket the worker holds.

use crate::codec::{is_eof, DataWriter, SliceReader};
use crate::error::Result;
use crate::pool::FixedBufferPool;
use crate::protocol::{decode_request, write_error_response, ConnectionState};
use crate::server::dispatcher::{Connection, DispatcherHandle};
use crate::server::handler;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Socket read granularity into the session buffer.
const READ_CHUNK: usize = 64 * 1024;

/// Shared immutable server state handed to every worker.
pub(crate) struct ServerContext {
    pub serve_root: PathBuf,
    pub pool: Arc<FixedBufferPool>,
}

pub(crate) struct Job {
    pub conn: Connection,
    pub origin: DispatcherHandle,
}

pub(crate) fn run(jobs: crossbeam_channel::Receiver<Job>, ctx: Arc<ServerContext>) {
    while let Ok(Job { mut conn, origin }) = jobs.recv() {
        match process(&mut conn, &ctx) {
            Ok(true) => {
                if !origin.rearm(conn) {
                    debug!("dispatcher gone; dropping connection");
                }
            }
            Ok(false) => {
                trace!("connection closed by peer");
            }
            Err(e) => {
                debug!(peer = %conn.session.peer, error = %e, "dropping broken connection");
            }
        }
    }
}

/// Service one readiness notification. `Ok(true)` re-arms the connection,
/// `Ok(false)` closes it cleanly, `Err` closes it as broken.
fn process(conn: &mut Connection, ctx: &ServerContext) -> Result<bool> {
    let Connection {
        ref mut stream,
        ref mut session,
        ..
    } = *conn;

    // Drain whatever the socket has; readiness was confirmed before dispatch.
    let mut peer_closed = false;
    loop {
        let read = session
            .buffer()
            .fill_from(READ_CHUNK, |space| stream.read(space));
        match read {
            Ok(0) => {
                peer_closed = true;
                break;
            }
            Ok(_) => continue,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    // Decode and answer every complete request the buffer holds; a trailing
    // partial request stays buffered for the next readiness round.
    loop {
        if session.buffer().is_empty() {
            break;
        }
        let decoded = {
            let mut r = SliceReader::new(session.buffer().filled());
            decode_request(&mut r).map(|request| (r.position(), request))
        };
        let (consumed, request) = match decoded {
            Ok(ok) => ok,
            Err(ref e) if is_eof(e) => break,
            Err(e) => {
                // Framing is lost; answer once, then drop the connection.
                session.state = ConnectionState::WritingErrorResponse;
                debug!(peer = %session.peer, error = %e, "undecodable request");
                let mut w = ConnWriter {
                    stream: &mut *stream,
                };
                write_error_response(&mut w, &e)?;
                return Ok(false);
            }
        };
        session.buffer().consume(consumed);
        session.touch();
        session.state = ConnectionState::Dispatching;
        let mut w = ConnWriter {
            stream: &mut *stream,
        };
        handler::handle(session, &ctx.serve_root, &ctx.pool, request, &mut w)?;
        session.state = ConnectionState::AwaitingCommand;
    }

    Ok(!peer_closed)
}

/// Writer over the worker's nonblocking socket. A full kernel buffer parks
/// the worker briefly instead of failing; only this connection waits.
struct ConnWriter<'a> {
    stream: &'a mut mio::net::TcpStream,
}

impl DataWriter for ConnWriter<'_> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let mut rest = bytes;
        while !rest.is_empty() {
            match self.stream.write(rest) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "connection write stalled",
                    )
                    .into())
                }
                Ok(n) => rest = &rest[n..],
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
