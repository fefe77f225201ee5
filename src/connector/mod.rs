//! Connector - event-driven Unix socket multiplexer
//!
//! The connector owns a listening Unix domain socket and an epoll loop on a
//! background thread. Protocols plug in through two capabilities:
//! - [`ConnectionHandler`] creates the per-connection tag on accept and
//!   tears it down on disconnect
//! - [`RequestHandler`] decodes and executes buffered messages
//!
//! With multithreaded clients enabled every connection gets its own worker
//! thread doing blocking reads, so a client stuck in a device write never
//! delays another. Otherwise all connections are serviced on the loop thread
//! with non-blocking sockets.

mod client;
pub mod stream;

pub use client::{Client, ClientId};
pub use stream::{InputStream, OutputLock, OutputStream};

use std::collections::HashMap;
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

/// Epoll token of the listening socket
const LISTENER_TOKEN: u64 = u64::MAX;
/// Epoll token of the stop waker
const WAKER_TOKEN: u64 = u64::MAX - 1;
/// Events fetched per epoll_wait call
const MAX_EVENTS: usize = 64;

/// Lifecycle capability: attach and detach protocol state
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Per-connection protocol state
    type Tag: Send + 'static;

    /// Called once per accepted client; the returned tag lives as long as the client
    fn handle_new_connection(&self, client_id: ClientId) -> Self::Tag;

    /// Called once when the client goes away, before its socket is closed
    fn handle_connection_shutdown(&self, client: &mut Client<Self::Tag>);
}

/// Request capability: consume buffered bytes of one connection
pub trait RequestHandler<T>: Send + Sync + 'static {
    /// Decode and execute at most one message.
    ///
    /// Returns `Ok(false)` when the buffered bytes don't hold a complete
    /// message yet; nothing may have been consumed in that case. An `Err`
    /// is a transport failure and closes the connection.
    fn handle_request(&self, client: &mut Client<T>) -> io::Result<bool>;
}

struct Handlers<C, R> {
    connection: C,
    request: R,
}

/// Listening socket plus the event loop serving it
pub struct Connector<C, R>
where
    C: ConnectionHandler,
    R: RequestHandler<C::Tag>,
{
    socket_path: PathBuf,
    /// Inode of the socket file we bound, so stop never removes a newer one
    socket_ino: Option<u64>,
    listener: Option<UnixListener>,
    handlers: Arc<Handlers<C, R>>,
    multithreaded_clients: bool,
    running: Arc<AtomicBool>,
    client_count: Arc<AtomicUsize>,
    waker: Option<UnixStream>,
    thread: Option<JoinHandle<()>>,
}

impl<C, R> Connector<C, R>
where
    C: ConnectionHandler,
    R: RequestHandler<C::Tag>,
{
    /// Bind the listening socket at `socket_path`.
    ///
    /// A stale socket file left by a previous run is removed and the parent
    /// directory is created if needed. Nothing is served until [`start`].
    ///
    /// [`start`]: Connector::start
    pub fn bind(
        socket_path: impl Into<PathBuf>,
        connection_handler: C,
        request_handler: R,
    ) -> io::Result<Self> {
        let socket_path = socket_path.into();

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        let socket_ino = std::fs::metadata(&socket_path).ok().map(|m| m.ino());
        log::info!("Listening on {}", socket_path.display());

        Ok(Self {
            socket_path,
            socket_ino,
            listener: Some(listener),
            handlers: Arc::new(Handlers {
                connection: connection_handler,
                request: request_handler,
            }),
            multithreaded_clients: false,
            running: Arc::new(AtomicBool::new(false)),
            client_count: Arc::new(AtomicUsize::new(0)),
            waker: None,
            thread: None,
        })
    }

    /// Serve each client on its own worker thread. Takes effect on `start()`.
    pub fn set_multithreaded_clients(&mut self, enabled: bool) {
        self.multithreaded_clients = enabled;
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Connections currently held, including finished workers not yet joined
    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    /// Spawn the event loop thread
    pub fn start(&mut self) -> io::Result<()> {
        let Some(listener) = self.listener.take() else {
            // Already started (or stopped for good)
            return Ok(());
        };

        let (waker, waker_rx) = UnixStream::pair()?;
        waker_rx.set_nonblocking(true)?;
        // Shared with workers, which poke the loop when they exit. A full
        // waker already guarantees a wakeup, so writes never need to block.
        waker.set_nonblocking(true)?;
        let worker_waker = waker.try_clone()?;
        let (finished_tx, finished_rx) = mpsc::channel();

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?;
        epoll
            .add(&listener, EpollEvent::new(EpollFlags::EPOLLIN, LISTENER_TOKEN))
            .map_err(io::Error::from)?;
        epoll
            .add(&waker_rx, EpollEvent::new(EpollFlags::EPOLLIN, WAKER_TOKEN))
            .map_err(io::Error::from)?;

        self.running.store(true, Ordering::Release);
        let event_loop = EventLoop {
            epoll,
            listener,
            waker: waker_rx,
            worker_waker,
            finished_tx,
            finished_rx,
            handlers: Arc::clone(&self.handlers),
            running: Arc::clone(&self.running),
            client_count: Arc::clone(&self.client_count),
            multithreaded: self.multithreaded_clients,
            next_id: 0,
            clients: HashMap::new(),
            workers: HashMap::new(),
        };

        let thread = thread::Builder::new()
            .name("aserver-connector".to_string())
            .spawn(move || event_loop.run());
        match thread {
            Ok(handle) => {
                self.thread = Some(handle);
                self.waker = Some(waker);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Stop serving: wake the loop, close every connection (running each
    /// disconnect hook) and remove the socket file. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(mut waker) = self.waker.take() {
            // The loop may already be gone; a failed wake is harmless then
            let _ = waker.write_all(&[1]);
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Connector thread panicked");
            }
        }

        self.listener = None;
        self.remove_socket_file();
    }

    /// Remove the socket file, unless another listener has since been bound
    /// at the same path
    fn remove_socket_file(&mut self) {
        let Some(bound_ino) = self.socket_ino.take() else {
            return;
        };
        match std::fs::metadata(&self.socket_path) {
            Ok(meta) if meta.ino() == bound_ino => {
                if let Err(e) = std::fs::remove_file(&self.socket_path) {
                    log::warn!("Failed to remove {}: {}", self.socket_path.display(), e);
                }
            }
            Ok(_) => log::debug!(
                "{} was rebound by another server, leaving it",
                self.socket_path.display()
            ),
            Err(_) => {}
        }
    }
}

impl<C, R> Drop for Connector<C, R>
where
    C: ConnectionHandler,
    R: RequestHandler<C::Tag>,
{
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    /// Clone of the client socket, used to unblock the worker on stop
    stream: UnixStream,
    handle: JoinHandle<()>,
}

struct EventLoop<C: ConnectionHandler, R> {
    epoll: Epoll,
    listener: UnixListener,
    waker: UnixStream,
    /// Write end of the waker, cloned into every worker
    worker_waker: UnixStream,
    /// Workers report their id here just before exiting
    finished_tx: mpsc::Sender<ClientId>,
    finished_rx: mpsc::Receiver<ClientId>,
    handlers: Arc<Handlers<C, R>>,
    running: Arc<AtomicBool>,
    client_count: Arc<AtomicUsize>,
    multithreaded: bool,
    next_id: ClientId,
    /// Clients serviced on the loop thread
    clients: HashMap<ClientId, Client<C::Tag>>,
    /// Clients serviced by their own thread
    workers: HashMap<ClientId, Worker>,
}

impl<C, R> EventLoop<C, R>
where
    C: ConnectionHandler,
    R: RequestHandler<C::Tag>,
{
    fn run(mut self) {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];

        while self.running.load(Ordering::Acquire) {
            let count = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(count) => count,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::error!("epoll_wait failed: {}", e);
                    break;
                }
            };

            for event in &events[..count] {
                match event.data() {
                    LISTENER_TOKEN => {
                        if let Err(e) = self.accept_pending() {
                            log::error!("Listening socket failed: {}", e);
                            self.running.store(false, Ordering::Release);
                        }
                    }
                    WAKER_TOKEN => self.drain_waker(),
                    id => self.service_client(id, event.events()),
                }
            }

            self.reap_workers();
        }

        self.close_all();
        log::info!("Connector stopped");
    }

    fn accept_pending(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => self.register_client(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn register_client(&mut self, stream: UnixStream) {
        let id = self.next_id;
        self.next_id += 1;

        // Accepted sockets don't inherit O_NONBLOCK from the listener
        if let Err(e) = stream.set_nonblocking(!self.multithreaded) {
            log::warn!("client {}: failed to configure socket: {}", id, e);
            return;
        }

        let tag = self.handlers.connection.handle_new_connection(id);
        let mut client = match Client::new(id, stream, tag) {
            Ok(client) => client,
            Err(e) => {
                log::warn!("client {}: failed to set up streams: {}", id, e);
                return;
            }
        };
        log::info!("client {} connected", id);

        if self.multithreaded {
            let shutdown_handle = match client.stream().try_clone() {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("client {}: failed to clone socket: {}", id, e);
                    self.handlers.connection.handle_connection_shutdown(&mut client);
                    return;
                }
            };
            let handlers = Arc::clone(&self.handlers);
            let exit = WorkerExit {
                id,
                finished: self.finished_tx.clone(),
                waker: self.worker_waker.try_clone().ok(),
            };
            let spawned = thread::Builder::new()
                .name(format!("aserver-client-{}", id))
                .spawn(move || {
                    serve_client(&handlers, client);
                    exit.notify();
                });
            match spawned {
                Ok(handle) => {
                    self.client_count.fetch_add(1, Ordering::AcqRel);
                    self.workers.insert(
                        id,
                        Worker {
                            stream: shutdown_handle,
                            handle,
                        },
                    );
                }
                Err(e) => {
                    // The client moved into the failed closure and was dropped with it
                    log::error!("client {}: failed to spawn worker: {}", id, e);
                }
            }
            return;
        }

        let interest = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP, id);
        if let Err(e) = self.epoll.add(client.stream(), interest) {
            log::warn!("client {}: epoll registration failed: {}", id, e);
            self.handlers.connection.handle_connection_shutdown(&mut client);
            return;
        }
        self.client_count.fetch_add(1, Ordering::AcqRel);
        self.clients.insert(id, client);
    }

    fn service_client(&mut self, id: ClientId, flags: EpollFlags) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };

        let mut keep = true;
        let mut eof = false;
        loop {
            match client.fill_input() {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("client {}: read failed: {}", id, e);
                    keep = false;
                    break;
                }
            }
        }

        if keep {
            keep = process_requests(&self.handlers.request, client);
        }

        let hung_up = flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR);
        if !keep || eof || hung_up {
            self.close_client(id);
        }
    }

    fn close_client(&mut self, id: ClientId) {
        let Some(mut client) = self.clients.remove(&id) else {
            return;
        };
        if let Err(e) = self.epoll.delete(client.stream()) {
            log::debug!("client {}: epoll removal failed: {}", id, e);
        }
        self.handlers.connection.handle_connection_shutdown(&mut client);
        client.shutdown();
        self.client_count.fetch_sub(1, Ordering::AcqRel);
        log::info!("client {} disconnected", id);
    }

    fn drain_waker(&mut self) {
        let mut buf = [0u8; 16];
        while let Ok(n) = io::Read::read(&mut self.waker, &mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    /// Join workers whose clients already hung up
    fn reap_workers(&mut self) {
        while let Ok(id) = self.finished_rx.try_recv() {
            if let Some(worker) = self.workers.remove(&id) {
                join_worker(id, worker.handle);
                self.client_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.close_client(id);
        }

        // Wake every blocked worker first, then wait for all of them
        for worker in self.workers.values() {
            let _ = worker.stream.shutdown(std::net::Shutdown::Both);
        }
        for (id, worker) in self.workers.drain() {
            join_worker(id, worker.handle);
            self.client_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Tells the event loop a worker is done so it can be joined right away
struct WorkerExit {
    id: ClientId,
    finished: mpsc::Sender<ClientId>,
    waker: Option<UnixStream>,
}

impl WorkerExit {
    fn notify(self) {
        // The loop may be gone already during stop
        let _ = self.finished.send(self.id);
        if let Some(mut waker) = self.waker {
            let _ = waker.write(&[1]);
        }
    }
}

fn join_worker(id: ClientId, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("client {}: worker panicked", id);
    }
}

/// Worker body for multithreaded clients: blocking reads until EOF
fn serve_client<C, R>(handlers: &Handlers<C, R>, mut client: Client<C::Tag>)
where
    C: ConnectionHandler,
    R: RequestHandler<C::Tag>,
{
    let id = client.id();
    loop {
        match client.fill_input() {
            Ok(0) => break,
            Ok(_) => {
                if !process_requests(&handlers.request, &mut client) {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("client {}: read failed: {}", id, e);
                break;
            }
        }
    }

    handlers.connection.handle_connection_shutdown(&mut client);
    client.shutdown();
    log::info!("client {} disconnected", id);
}

/// Run the request handler until it needs more bytes.
///
/// Returns `false` if the connection must be closed.
fn process_requests<T, R: RequestHandler<T>>(handler: &R, client: &mut Client<T>) -> bool {
    while client.input().available() > 0 {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle_request(client)));
        match result {
            Ok(Ok(true)) => continue,
            Ok(Ok(false)) => break,
            Ok(Err(e)) => {
                log::warn!("client {}: request failed: {}", client.id(), e);
                return false;
            }
            Err(_) => {
                log::error!("client {}: request handler panicked", client.id());
                return false;
            }
        }
    }
    true
}
