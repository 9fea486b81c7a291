//! The connection orchestrator: acceptor, reactor, and the staged pipeline.
//!
//! ```text
//!                         ┌───────────────┐
//!   accept() ────────────>│  all_sockets  │ fd -> Arc<Connection>
//!                         └───────┬───────┘
//!                                 │ arm(fd, READABLE)
//!                                 ▼
//!                      ┌─────────────────────┐
//!                      │   Reactor (epoll)   │  one-shot, edge-triggered
//!                      └──────────┬──────────┘
//!               readable │                 │ writable
//!                        ▼                 ▼
//!              ┌──────────────┐    ┌──────────────┐
//!              │  read pool   │    │  write pool  │
//!              │ fill in_buf  │    │ drain out_buf│
//!              └──────┬───────┘    └──────▲───────┘
//!                     ▼                   │
//!              ┌──────────────────────────┴──┐
//!              │        execute pool         │
//!              │ frame -> command -> shards  │
//!              └─────────────────────────────┘
//! ```
//!
//! Three index sets record which part of the pipeline owns each descriptor:
//! `epoll_set` (armed, waiting for readiness), `processing_set` (a read or
//! execute job queued or running), `write_set` (draining or waiting for
//! write readiness). A descriptor is in at most one set, which is what
//! guarantees at most one active job per connection; the connection mutex
//! guards data, not scheduling.
//!
//! Locks follow a fixed hierarchy (see [`rank`]): `all_sockets`, then a
//! connection mutex, then the three sets, with storage shards innermost.

pub mod conn;
pub mod pool;
pub mod rank;
pub mod reactor;

use crate::commands::CommandHandler;
use crate::config::Config;
use crate::protocol::{parse_frame, RespValue};
use crate::storage::{StorageEngine, NUM_SHARDS};
use conn::{Connection, Phase, ReadOutcome, WriteOutcome};
use mio::{Events, Interest};
use parking_lot::{Condvar, Mutex, RwLock};
use pool::{JobStatus, ThreadPool};
use rank::{Rank, RankScope};
use reactor::{Reactor, ReactorHandle, WAKE_TOKEN};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Frames executed per job before the worker yields the connection.
const MAX_FRAMES_PER_EXEC: usize = 32;

/// Startup failures. Anything here aborts the server before it serves a
/// single byte; runtime failures never surface this way, they cost at most
/// the one connection they happened on.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to inspect the listening socket")]
    Listener(#[source] io::Error),

    #[error("failed to set up the readiness reactor")]
    Reactor(#[source] io::Error),

    #[error("failed to spawn the {what}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Which index set a descriptor currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageSet {
    Epoll,
    Processing,
    Write,
}

/// Server-wide counters, updated with relaxed atomics.
#[derive(Debug, Default)]
struct ServerStats {
    connections_accepted: AtomicU64,
    connections_active: AtomicU64,
    commands_processed: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time copy of the server counters.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub commands_processed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

struct Inner {
    handler: CommandHandler,
    engine: Arc<StorageEngine>,

    read_pool: ThreadPool,
    execute_pool: ThreadPool,
    write_pool: ThreadPool,
    teardown_pool: ThreadPool,

    /// Canonical strong reference for every live connection.
    all_sockets: RwLock<HashMap<RawFd, Arc<Connection>>>,
    epoll_set: Mutex<HashSet<RawFd>>,
    write_set: Mutex<HashSet<RawFd>>,
    processing_set: Mutex<HashSet<RawFd>>,

    reactor: ReactorHandle,
    listener_fd: RawFd,
    local_addr: SocketAddr,
    max_events: usize,
    buffer_cap: usize,

    destroying: AtomicBool,
    shutdown_flag: Mutex<bool>,
    shutdown_cv: Condvar,
    stats: ServerStats,
}

/// A running relaykv server.
///
/// Construction order is shards, pools, reactor, acceptor; destruction runs
/// in reverse. Dropping the server shuts it down if [`Server::shutdown`] was
/// never called.
pub struct Server {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    accept_thread: Option<JoinHandle<()>>,
    reactor_thread: Option<JoinHandle<()>>,
    finalized: bool,
}

/// Clonable handle that can request shutdown from any thread, e.g. a signal
/// handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<Inner>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        self.inner.initiate_shutdown();
    }
}

impl Server {
    /// Binds the listener and starts the whole pipeline.
    pub fn bind(config: &Config) -> Result<Server, ServerError> {
        let engine = Arc::new(StorageEngine::new());
        let handler = CommandHandler::new(Arc::clone(&engine));

        let workers = config.workers_per_stage;
        let read_pool = pool_or_err("read worker pool", "read", workers)?;
        let execute_pool = pool_or_err("execute worker pool", "execute", workers)?;
        let write_pool = pool_or_err("write worker pool", "write", workers)?;
        let teardown_pool = pool_or_err("teardown worker", "teardown", 1)?;

        let (reactor, reactor_handle) = Reactor::new().map_err(ServerError::Reactor)?;

        let listener =
            TcpListener::bind(config.bind_address()).map_err(|source| ServerError::Bind {
                addr: config.bind_address(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ServerError::Listener)?;

        let inner = Arc::new(Inner {
            handler,
            engine,
            read_pool,
            execute_pool,
            write_pool,
            teardown_pool,
            all_sockets: RwLock::new(HashMap::new()),
            epoll_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(HashSet::new()),
            processing_set: Mutex::new(HashSet::new()),
            reactor: reactor_handle,
            listener_fd: listener.as_raw_fd(),
            local_addr,
            max_events: config.max_events,
            buffer_cap: config.buffer_cap,
            destroying: AtomicBool::new(false),
            shutdown_flag: Mutex::new(false),
            shutdown_cv: Condvar::new(),
            stats: ServerStats::default(),
        });

        let reactor_thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("reactor".to_string())
                .spawn(move || reactor_loop(&inner, reactor))
                .map_err(|source| ServerError::Spawn {
                    what: "reactor thread",
                    source,
                })?
        };

        let accept_thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("acceptor".to_string())
                .spawn(move || accept_loop(&inner, listener))
                .map_err(|source| ServerError::Spawn {
                    what: "acceptor thread",
                    source,
                })?
        };

        info!(
            addr = %local_addr,
            shards = NUM_SHARDS,
            workers_per_stage = workers,
            "listening"
        );

        Ok(Server {
            inner,
            local_addr,
            accept_thread: Some(accept_thread),
            reactor_thread: Some(reactor_thread),
            finalized: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn engine(&self) -> Arc<StorageEngine> {
        Arc::clone(&self.inner.engine)
    }

    /// Blocks until shutdown is requested, then tears everything down.
    pub fn run(&mut self) {
        {
            let mut requested = self.inner.shutdown_flag.lock();
            while !*requested {
                self.inner.shutdown_cv.wait(&mut requested);
            }
        }
        self.finalize();
    }

    /// Requests shutdown and tears everything down before returning.
    pub fn shutdown(&mut self) {
        self.inner.initiate_shutdown();
        self.finalize();
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reactor_thread.take() {
            let _ = handle.join();
        }

        self.inner.read_pool.shutdown();
        self.inner.execute_pool.shutdown();
        self.inner.write_pool.shutdown();
        self.inner.teardown_pool.shutdown();

        let survivors: Vec<RawFd> = {
            let _rank = RankScope::enter(Rank::AllSockets);
            self.inner.all_sockets.read().keys().copied().collect()
        };
        for fd in survivors {
            self.inner.remove_socket(fd);
        }

        info!("shutdown complete");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.initiate_shutdown();
        self.finalize();
    }
}

fn pool_or_err(
    what: &'static str,
    name: &'static str,
    workers: usize,
) -> Result<ThreadPool, ServerError> {
    ThreadPool::new(name, workers).map_err(|source| ServerError::Spawn { what, source })
}

/// Blocking accept loop; runs on its own thread until shutdown.
fn accept_loop(inner: &Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if inner.destroying.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = Inner::register_connection(inner, stream, peer) {
                    warn!(peer = %peer, error = %e, "could not register connection");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if inner.destroying.load(Ordering::Acquire) {
                    break;
                }
                // Transient accept failures (EMFILE and friends): back off
                // briefly instead of spinning.
                warn!(error = %e, "accept failed");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    debug!("acceptor stopped");
}

/// The readiness loop; runs on its own thread until shutdown.
fn reactor_loop(inner: &Arc<Inner>, mut reactor: Reactor) {
    let mut events = Events::with_capacity(inner.max_events);
    loop {
        if let Err(e) = reactor.wait(&mut events) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "readiness wait failed");
            return;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                if inner.destroying.load(Ordering::Acquire) {
                    debug!("reactor stopped");
                    return;
                }
                continue;
            }

            let fd = event.token().0 as RawFd;
            // One-shot: nothing more is delivered for this descriptor until
            // a stage arms it again.
            let _ = inner.reactor.disarm(fd);
            // A half-closed peer still flags readable, so the read stage
            // gets to observe the EOF; a full hangup goes straight to
            // teardown.
            let hangup = event.is_read_closed() && event.is_write_closed();
            Inner::dispatch(
                inner,
                fd,
                event.is_readable(),
                event.is_writable(),
                event.is_error() || hangup,
            );
        }
    }
}

impl Inner {
    /// Routes one readiness event to the matching stage pool.
    fn dispatch(this: &Arc<Self>, fd: RawFd, readable: bool, writable: bool, errored: bool) {
        let conn = {
            let _rank = RankScope::enter(Rank::AllSockets);
            this.all_sockets.read().get(&fd).cloned()
        };
        // Already torn down; the event raced the removal.
        let Some(conn) = conn else { return };

        if errored {
            trace!(fd, "error event");
            Inner::schedule_teardown(this, fd);
            return;
        }

        if readable {
            this.set_remove(StageSet::Epoll, fd);
            this.set_insert(StageSet::Processing, fd);
            let inner = Arc::clone(this);
            this.read_pool.submit(move || Inner::stage_read(&inner, &conn));
        } else if writable {
            this.set_remove(StageSet::Epoll, fd);
            this.set_insert(StageSet::Write, fd);
            let inner = Arc::clone(this);
            this.write_pool.submit(move || Inner::stage_write(&inner, &conn));
        }
    }

    /// Read stage: drain the socket into `in_buf`, then hand the connection
    /// to the execute pool. The descriptor stays in `processing_set`; only
    /// job ownership moves.
    fn stage_read(this: &Arc<Self>, conn: &Arc<Connection>) -> JobStatus {
        let fd = conn.fd();
        let _rank = RankScope::enter(Rank::Conn);
        let mut st = conn.lock();
        if st.phase == Phase::Closing {
            this.set_remove(StageSet::Processing, fd);
            return 0;
        }
        st.phase = Phase::Reading;

        match conn.fill(&mut st, this.buffer_cap) {
            ReadOutcome::Progress(n) => {
                this.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                trace!(fd, bytes = n, "read");
                drop(st);
                let inner = Arc::clone(this);
                let conn = Arc::clone(conn);
                this.execute_pool
                    .submit(move || Inner::stage_execute(&inner, &conn));
                0
            }
            ReadOutcome::Eof => {
                drop(st);
                debug!(fd, "peer closed");
                Inner::schedule_teardown(this, fd);
                0
            }
            ReadOutcome::Overflow => {
                drop(st);
                warn!(fd, cap = this.buffer_cap, "input buffer cap exceeded");
                Inner::schedule_teardown(this, fd);
                -1
            }
            ReadOutcome::Failed(e) => {
                drop(st);
                debug!(fd, error = %e, "read failed");
                Inner::schedule_teardown(this, fd);
                -1
            }
        }
    }

    /// Execute stage: frame, validate, run against the shards, and queue
    /// replies. Batches up to [`MAX_FRAMES_PER_EXEC`] frames; a connection
    /// with more input than that continues after its replies drain.
    fn stage_execute(this: &Arc<Self>, conn: &Arc<Connection>) -> JobStatus {
        let fd = conn.fd();
        let _rank = RankScope::enter(Rank::Conn);
        let mut st = conn.lock();
        if st.phase == Phase::Closing {
            this.set_remove(StageSet::Processing, fd);
            return 0;
        }
        st.phase = Phase::Parsing;

        let mut frames = 0;
        while frames < MAX_FRAMES_PER_EXEC && !st.close_after_drain {
            match parse_frame(st.unparsed()) {
                Ok(None) => break,
                Ok(Some((frame, consumed))) => {
                    st.parse_cursor += consumed;
                    frames += 1;
                    let reply = {
                        let _shard = RankScope::enter(Rank::Shard);
                        this.handler.execute(frame)
                    };
                    reply.encode_into(&mut st.out_buf);
                    this.stats.commands_processed.fetch_add(1, Ordering::Relaxed);
                    if st.out_buf.len() > this.buffer_cap {
                        drop(st);
                        warn!(fd, cap = this.buffer_cap, "output buffer cap exceeded");
                        Inner::schedule_teardown(this, fd);
                        return -1;
                    }
                    st.compact();
                }
                Err(e) => {
                    debug!(fd, error = %e, "framing error");
                    RespValue::error("ERR protocol error").encode_into(&mut st.out_buf);
                    st.close_after_drain = true;
                }
            }
        }

        if !st.out_buf.is_empty() {
            this.set_remove(StageSet::Processing, fd);
            this.set_insert(StageSet::Write, fd);
            let inner = Arc::clone(this);
            let conn = Arc::clone(conn);
            this.write_pool
                .submit(move || Inner::stage_write(&inner, &conn));
        } else {
            st.phase = Phase::Idle;
            this.set_remove(StageSet::Processing, fd);
            if let Err(e) = this.rearm_read(fd) {
                drop(st);
                debug!(fd, error = %e, "rearm failed");
                Inner::schedule_teardown(this, fd);
                return -1;
            }
        }
        0
    }

    /// Write stage: drain `out_buf`, then route the connection onward:
    /// back to execute when unparsed input remains, back to the reactor
    /// otherwise, or stay parked for write readiness after a short write.
    fn stage_write(this: &Arc<Self>, conn: &Arc<Connection>) -> JobStatus {
        let fd = conn.fd();
        let _rank = RankScope::enter(Rank::Conn);
        let mut st = conn.lock();
        if st.phase == Phase::Closing {
            this.set_remove(StageSet::Write, fd);
            return 0;
        }
        st.phase = Phase::Writing;

        match conn.flush(&mut st) {
            WriteOutcome::Failed(e) => {
                drop(st);
                debug!(fd, error = %e, "write failed");
                Inner::schedule_teardown(this, fd);
                -1
            }
            WriteOutcome::Blocked(n) => {
                this.stats.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                trace!(fd, bytes = n, "short write");
                if let Err(e) = this.reactor.arm(fd, Interest::WRITABLE) {
                    drop(st);
                    debug!(fd, error = %e, "rearm failed");
                    Inner::schedule_teardown(this, fd);
                    return -1;
                }
                0
            }
            WriteOutcome::Drained(n) => {
                this.stats.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                trace!(fd, bytes = n, "drained");
                if st.close_after_drain {
                    drop(st);
                    Inner::schedule_teardown(this, fd);
                    return 0;
                }
                if st.has_unparsed() {
                    st.phase = Phase::Parsing;
                    this.set_remove(StageSet::Write, fd);
                    this.set_insert(StageSet::Processing, fd);
                    let inner = Arc::clone(this);
                    let conn = Arc::clone(conn);
                    this.execute_pool
                        .submit(move || Inner::stage_execute(&inner, &conn));
                } else {
                    st.phase = Phase::Idle;
                    this.set_remove(StageSet::Write, fd);
                    if let Err(e) = this.rearm_read(fd) {
                        drop(st);
                        debug!(fd, error = %e, "rearm failed");
                        Inner::schedule_teardown(this, fd);
                        return -1;
                    }
                }
                0
            }
        }
    }

    /// Accepts ownership of a fresh socket: non-blocking, indexed, armed.
    fn register_connection(
        this: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);

        let conn = Arc::new(Connection::new(stream, peer));
        let fd = conn.fd();
        {
            let _rank = RankScope::enter(Rank::AllSockets);
            this.all_sockets.write().insert(fd, conn);
        }
        this.set_insert(StageSet::Epoll, fd);
        this.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        this.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = this.reactor.arm(fd, Interest::READABLE) {
            this.remove_socket(fd);
            return Err(e);
        }

        debug!(fd, peer = %peer, "accepted");
        Ok(())
    }

    /// Puts the descriptor back under the reactor's watch for input.
    fn rearm_read(&self, fd: RawFd) -> io::Result<()> {
        self.set_insert(StageSet::Epoll, fd);
        self.reactor.arm(fd, Interest::READABLE)
    }

    fn schedule_teardown(this: &Arc<Self>, fd: RawFd) {
        let inner = Arc::clone(this);
        this.teardown_pool.submit(move || {
            inner.remove_socket(fd);
            0
        });
    }

    /// Tears a connection down. Idempotent: a second call for the same
    /// descriptor finds nothing in `all_sockets` and returns.
    fn remove_socket(&self, fd: RawFd) {
        let conn = {
            let _rank = RankScope::enter(Rank::AllSockets);
            self.all_sockets.write().remove(&fd)
        };
        let Some(conn) = conn else { return };

        {
            let _rank = RankScope::enter(Rank::Conn);
            conn.lock().phase = Phase::Closing;
        }
        self.set_remove(StageSet::Epoll, fd);
        self.set_remove(StageSet::Write, fd);
        self.set_remove(StageSet::Processing, fd);
        let _ = self.reactor.disarm(fd);
        conn.sever();

        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        debug!(fd, peer = %conn.peer(), "closed");
        // The descriptor itself closes once in-flight jobs drop their
        // remaining references.
    }

    fn initiate_shutdown(&self) {
        if self.destroying.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutdown requested");

        // Unblock the acceptor. shutdown(2) does it on Linux; the connect
        // covers platforms where a listening socket rejects shutdown.
        unsafe {
            libc::shutdown(self.listener_fd, libc::SHUT_RDWR);
        }
        let _ = TcpStream::connect(self.local_addr);

        let _ = self.reactor.wake();

        let mut requested = self.shutdown_flag.lock();
        *requested = true;
        self.shutdown_cv.notify_all();
    }

    fn stage_set(&self, which: StageSet) -> (&Mutex<HashSet<RawFd>>, Rank) {
        match which {
            StageSet::Epoll => (&self.epoll_set, Rank::EpollSet),
            StageSet::Write => (&self.write_set, Rank::WriteSet),
            StageSet::Processing => (&self.processing_set, Rank::ProcessingSet),
        }
    }

    fn set_insert(&self, which: StageSet, fd: RawFd) {
        let (set, rank) = self.stage_set(which);
        let _rank = RankScope::enter(rank);
        set.lock().insert(fd);
    }

    fn set_remove(&self, which: StageSet, fd: RawFd) -> bool {
        let (set, rank) = self.stage_set(which);
        let _rank = RankScope::enter(rank);
        set.lock().remove(&fd)
    }
}

impl ServerStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}
