//! Accept loop: the single thread owning the listening socket.

use crate::server::dispatcher::DispatcherHandle;
use crate::server::{RoundRobin, WAKER_TOKEN};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

const LISTENER_TOKEN: Token = Token(0);

pub(crate) fn spawn(
    mut listener: TcpListener,
    dispatchers: Vec<DispatcherHandle>,
    shutdown: Arc<AtomicBool>,
) -> crate::error::Result<(Arc<Waker>, JoinHandle<()>)> {
    let poll = Poll::new()?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

    let thread = std::thread::Builder::new()
        .name("acceptor".to_string())
        .spawn(move || run(poll, listener, dispatchers, shutdown))?;
    Ok((waker, thread))
}

fn run(
    mut poll: Poll,
    mut listener: TcpListener,
    dispatchers: Vec<DispatcherHandle>,
    shutdown: Arc<AtomicBool>,
) {
    let mut rotation = RoundRobin::new(dispatchers);
    let mut events = Events::with_capacity(64);

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "acceptor poll failed");
            break;
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer, error = %e, "set_nodelay failed");
                    }
                    let dispatcher = rotation.next();
                    debug!(%peer, dispatcher = dispatcher.id, "accepted connection");
                    if !dispatcher.assign(stream) {
                        warn!(%peer, "dispatcher rejected connection");
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    let _ = poll.registry().deregister(&mut listener);
    debug!("acceptor stopped");
}
