//! Multiplexed network server.
//!
//! One acceptor thread owns the listening socket and assigns connections to
//! dispatchers round-robin; each dispatcher runs an independent readiness
//! loop; a shared bounded worker pool executes the actual request handling.
//! No blocking network call ever runs on a dispatcher thread.

mod acceptor;
pub mod config;
mod dispatcher;
mod handler;
mod session;
mod worker;

pub use config::{ConfigFile, ServerConfig};

use crate::error::Result;
use crate::pool::FixedBufferPool;
use mio::{Token, Waker};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Token reserved for cross-thread wakeups on every poll.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Remove-from-front, append-to-back rotation for even load distribution.
pub(crate) struct RoundRobin<T: Clone> {
    queue: VecDeque<T>,
}

impl<T: Clone> RoundRobin<T> {
    pub fn new(items: Vec<T>) -> Self {
        assert!(!items.is_empty(), "rotation needs at least one entry");
        Self {
            queue: items.into(),
        }
    }

    pub fn next(&mut self) -> T {
        let item = self.queue.pop_front().expect("rotation never empties");
        self.queue.push_back(item.clone());
        item
    }
}

/// A running server. Dropping it (or calling [`Server::stop`]) shuts down
/// acceptor → dispatchers → workers, blocking until every loop thread has
/// actually exited.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    acceptor_waker: Arc<Waker>,
    acceptor: Option<JoinHandle<()>>,
    dispatchers: Vec<dispatcher::DispatcherHandle>,
    dispatcher_threads: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    jobs: Option<crossbeam_channel::Sender<worker::Job>>,
}

impl Server {
    /// Bind and start serving. A bind failure is fatal; everything after the
    /// socket is up isolates failures per connection.
    pub fn start(config: ServerConfig) -> Result<Server> {
        config.validate()?;
        let listener = mio::net::TcpListener::bind(config.bind)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let pool = Arc::new(FixedBufferPool::new(config.buffer_size));
        let ctx = Arc::new(worker::ServerContext {
            serve_root: config.root.clone(),
            pool: Arc::clone(&pool),
        });

        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let workers = (0..config.workers)
            .map(|i| {
                let rx = jobs_rx.clone();
                let ctx = Arc::clone(&ctx);
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker::run(rx, ctx))
                    .map_err(crate::error::Error::Io)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut dispatchers = Vec::with_capacity(config.dispatchers);
        let mut dispatcher_threads = Vec::with_capacity(config.dispatchers);
        for id in 0..config.dispatchers {
            let (handle, thread) = dispatcher::spawn(
                id,
                jobs_tx.clone(),
                Arc::clone(&pool),
                Arc::clone(&shutdown),
                config.idle_timeout,
            )?;
            dispatchers.push(handle);
            dispatcher_threads.push(thread);
        }

        let (acceptor_waker, acceptor) =
            acceptor::spawn(listener, dispatchers.clone(), Arc::clone(&shutdown))?;

        info!(
            addr = %local_addr,
            root = %config.root.display(),
            dispatchers = config.dispatchers,
            workers = config.workers,
            "server started"
        );

        Ok(Server {
            local_addr,
            shutdown,
            acceptor_waker,
            acceptor: Some(acceptor),
            dispatchers,
            dispatcher_threads,
            workers,
            jobs: Some(jobs_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal shutdown and block until every loop thread has exited.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.acceptor_waker.wake() {
            warn!(error = %e, "acceptor wake failed");
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }

        for dispatcher in &self.dispatchers {
            dispatcher.wake();
        }
        for thread in self.dispatcher_threads.drain(..) {
            let _ = thread.join();
        }

        // Workers exit once every job sender (dispatchers + ours) is gone.
        self.jobs.take();
        for thread in self.workers.drain(..) {
            let _ = thread.join();
        }
        info!(addr = %self.local_addr, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_is_even() {
        // 2×N assignments over N dispatchers land exactly 2 on each.
        let n = 4;
        let mut rotation = RoundRobin::new((0..n).collect::<Vec<_>>());
        let mut counts = vec![0usize; n];
        for _ in 0..2 * n {
            counts[rotation.next()] += 1;
        }
        assert_eq!(counts, vec![2; n]);
    }

    #[test]
    fn test_round_robin_order_is_fifo() {
        let mut rotation = RoundRobin::new(vec!["a", "b", "c"]);
        let order: Vec<_> = (0..6).map(|_| rotation.next()).collect();
        assert_eq!(order, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_start_and_stop_joins_all_threads() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = ServerConfig::new(tmp.path())
            .with_bind("127.0.0.1:0".parse().unwrap())
            .with_dispatchers(2)
            .with_workers(2)
            .with_buffer_size(1024);
        let server = Server::start(config).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        server.stop();
    }

    #[test]
    fn test_bind_failure_is_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let first = Server::start(
            ServerConfig::new(tmp.path()).with_bind("127.0.0.1:0".parse().unwrap()),
        )
        .unwrap();
        let taken = first.local_addr();

        let second = Server::start(ServerConfig::new(tmp.path()).with_bind(taken));
        assert!(second.is_err());
        first.stop();
    }
}
