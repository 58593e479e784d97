//! Dispatcher: one readiness-multiplexing loop plus its registered
//! connections.
//!
//! On readiness the connection's interest is disabled (deregistered) and the
//! read/decode/handle/write work goes to the shared worker pool; the worker
//! re-arms the connection through [`DispatcherHandle::rearm`] when it is done.
//! Parsing a request is not guaranteed to be fast, and doing it here would
//! stall every other connection assigned to this loop.

use crate::pool::FixedBufferPool;
use crate::server::session::Session;
use crate::server::worker::Job;
use crate::server::WAKER_TOKEN;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Poll timeout; bounds how stale the idle sweep can be.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct Connection {
    pub stream: TcpStream,
    pub session: Session,
    pub token: Token,
}

pub(crate) enum DispatcherMsg {
    /// Fresh connection from the acceptor.
    New(TcpStream),
    /// Connection returning from a worker, ready for more readiness.
    Rearm(Connection),
}

/// Cheap cloneable address of one dispatcher loop.
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    pub id: usize,
    tx: crossbeam_channel::Sender<DispatcherMsg>,
    waker: Arc<Waker>,
}

impl DispatcherHandle {
    pub fn assign(&self, stream: TcpStream) -> bool {
        self.tx.send(DispatcherMsg::New(stream)).is_ok() && self.wake()
    }

    pub fn rearm(&self, conn: Connection) -> bool {
        self.tx.send(DispatcherMsg::Rearm(conn)).is_ok() && self.wake()
    }

    pub fn wake(&self) -> bool {
        match self.waker.wake() {
            Ok(()) => true,
            Err(e) => {
                warn!(dispatcher = self.id, error = %e, "waker failed");
                false
            }
        }
    }
}

pub(crate) fn spawn(
    id: usize,
    jobs: crossbeam_channel::Sender<Job>,
    pool: Arc<FixedBufferPool>,
    shutdown: Arc<AtomicBool>,
    idle_timeout: Duration,
) -> crate::error::Result<(DispatcherHandle, JoinHandle<()>)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = DispatcherHandle { id, tx, waker };

    let loop_handle = handle.clone();
    let thread = std::thread::Builder::new()
        .name(format!("dispatcher-{id}"))
        .spawn(move || run(id, poll, rx, jobs, loop_handle, pool, shutdown, idle_timeout))
        .map_err(crate::error::Error::Io)?;
    Ok((handle, thread))
}

#[allow(clippy::too_many_arguments)]
fn run(
    id: usize,
    mut poll: Poll,
    rx: crossbeam_channel::Receiver<DispatcherMsg>,
    jobs: crossbeam_channel::Sender<Job>,
    handle: DispatcherHandle,
    pool: Arc<FixedBufferPool>,
    shutdown: Arc<AtomicBool>,
    idle_timeout: Duration,
) {
    let mut events = Events::with_capacity(256);
    let mut conns: HashMap<Token, Connection> = HashMap::new();
    let mut next_token = 0usize;

    loop {
        if let Err(e) = poll.poll(&mut events, Some(SWEEP_INTERVAL)) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!(dispatcher = id, error = %e, "poll failed");
            break;
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            // Disable interest for the duration of processing; the worker
            // owns the connection exclusively until it re-arms.
            if let Some(mut conn) = conns.remove(&event.token()) {
                if let Err(e) = poll.registry().deregister(&mut conn.stream) {
                    warn!(dispatcher = id, peer = %conn.session.peer, error = %e, "deregister failed");
                    continue;
                }
                let _ = jobs.send(Job {
                    conn,
                    origin: handle.clone(),
                });
            }
        }

        while let Ok(msg) = rx.try_recv() {
            let mut conn = match msg {
                DispatcherMsg::New(stream) => {
                    let peer = stream
                        .peer_addr()
                        .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("literal addr"));
                    let token = Token(next_token);
                    next_token += 1;
                    debug!(dispatcher = id, %peer, "connection assigned");
                    Connection {
                        stream,
                        session: Session::new(peer, &pool),
                        token,
                    }
                }
                DispatcherMsg::Rearm(conn) => conn,
            };
            if let Err(e) = poll
                .registry()
                .register(&mut conn.stream, conn.token, Interest::READABLE)
            {
                warn!(dispatcher = id, peer = %conn.session.peer, error = %e, "register failed");
                continue;
            }
            conns.insert(conn.token, conn);
        }

        if shutdown.load(Ordering::Acquire) {
            for (_, mut conn) in conns.drain() {
                let _ = poll.registry().deregister(&mut conn.stream);
            }
            debug!(dispatcher = id, "dispatcher stopped");
            return;
        }

        if !idle_timeout.is_zero() {
            let registry = poll.registry();
            conns.retain(|_, conn| {
                if conn.session.idle_for() > idle_timeout {
                    info!(dispatcher = id, peer = %conn.session.peer, "closing idle connection");
                    let _ = registry.deregister(&mut conn.stream);
                    false
                } else {
                    true
                }
            });
        }
    }
}
