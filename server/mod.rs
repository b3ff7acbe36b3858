// nREPL server: listeners, connection registry, lifecycle
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod evaluator;
pub mod lisp;
pub mod session;

pub use config::ServerConfig;
pub use dispatch::{ConnectionState, Dispatcher, Responder};
pub use error::{ServerError, SessionError};
pub use evaluator::{CancelToken, EvalIo, EvalOutcome, Evaluator, OutputStream};
pub use lisp::{LispEvaluator, Namespace};
pub use session::{InterruptOutcome, SessionInfo, SessionManager};

use nrepl_transport::{
    TcpTransportListener, Transport, TransportListener, UnixTransportListener,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// Idle accept loops re-check the shutdown flag this often
const ACCEPT_POLL: Duration = Duration::from_millis(25);
const BIND_RETRY: Duration = Duration::from_millis(100);

struct LiveConnection {
    control: Box<dyn Transport>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    next: AtomicU64,
    live: Mutex<HashMap<u64, LiveConnection>>,
}

impl Registry {
    fn drain(&self) -> Vec<LiveConnection> {
        self.live.lock().drain().map(|(_, c)| c).collect()
    }
}

pub struct Server;

impl Server {
    /// Bind and start serving in the background.
    pub fn start<E: Evaluator>(config: ServerConfig, evaluator: E) -> Result<ServerHandle<E>, ServerError> {
        let sessions = Arc::new(SessionManager::new());
        let evaluator = Arc::new(evaluator);
        let evaluator_name = evaluator.name().to_string();
        let dispatcher = Dispatcher::new(Arc::clone(&sessions), evaluator);
        let shutdown = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(Registry::default());

        let address = config.address();
        let mut tcp = TcpTransportListener::new(&address);
        bind_with_retry(&mut tcp, &address, config.start_timeout)?;
        let local_addr = tcp.socket_addr().ok_or_else(|| ServerError::BindFailure {
            address: address.clone(),
            source: std::io::Error::new(ErrorKind::AddrNotAvailable, "no local address"),
        })?;

        // Bind everything before any acceptor runs, so a failure leaves no
        // threads behind
        let unix = match &config.unix_socket {
            Some(path) => {
                let mut unix = UnixTransportListener::new(path);
                bind_with_retry(&mut unix, &path.display().to_string(), config.start_timeout)?;
                Some(unix)
            }
            None => None,
        };

        let mut acceptors = vec![spawn_acceptor(
            tcp,
            dispatcher.clone(),
            &config,
            Arc::clone(&shutdown),
            Arc::clone(&registry),
        )?];
        if let Some(unix) = unix {
            acceptors.push(spawn_acceptor(
                unix,
                dispatcher,
                &config,
                Arc::clone(&shutdown),
                Arc::clone(&registry),
            )?);
        }

        info!(addr = %local_addr, unix = ?config.unix_socket, evaluator = %evaluator_name, "nREPL server started");
        Ok(ServerHandle {
            local_addr,
            unix_socket: config.unix_socket,
            sessions,
            shutdown,
            registry,
            acceptors,
            stopped: false,
        })
    }

    /// Start and report the bound port (or the failure) to `on_start`.
    pub fn start_with_callback<E, F>(config: ServerConfig, evaluator: E, on_start: F) -> Option<ServerHandle<E>>
    where
        E: Evaluator,
        F: FnOnce(Result<u16, &ServerError>),
    {
        match Server::start(config, evaluator) {
            Ok(handle) => {
                on_start(Ok(handle.port()));
                Some(handle)
            }
            Err(e) => {
                on_start(Err(&e));
                None
            }
        }
    }
}

fn bind_with_retry<L: TransportListener>(
    listener: &mut L,
    address: &str,
    timeout: Duration,
) -> Result<(), ServerError> {
    let deadline = Instant::now() + timeout;
    loop {
        match listener.bind() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AddrInUse && Instant::now() < deadline => {
                debug!(address = %address, "address in use, retrying bind");
                thread::sleep(BIND_RETRY);
            }
            Err(source) => {
                return Err(ServerError::BindFailure {
                    address: address.to_string(),
                    source,
                })
            }
        }
    }
}

fn spawn_acceptor<L, E>(
    mut listener: L,
    dispatcher: Dispatcher<E>,
    config: &ServerConfig,
    shutdown: Arc<AtomicBool>,
    registry: Arc<Registry>,
) -> Result<JoinHandle<()>, ServerError>
where
    L: TransportListener + 'static,
    E: Evaluator,
{
    listener.set_nonblocking(true)?;
    let write_queue = config.write_queue;
    let verbose = config.verbose;
    let handle = thread::Builder::new()
        .name("nrepl-accept".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                let transport = match listener.accept() {
                    Ok(t) => t,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                        continue;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(listener = %listener.local_addr(), error = %e, "accept failed");
                        thread::sleep(ACCEPT_POLL);
                        continue;
                    }
                };
                if let Err(e) = register(transport, dispatcher.clone(), write_queue, verbose, &registry) {
                    warn!(error = %e, "dropping connection");
                }
            }
            debug!(listener = %listener.local_addr(), "acceptor stopped");
        })?;
    Ok(handle)
}

fn register<T, E>(
    transport: T,
    dispatcher: Dispatcher<E>,
    write_queue: usize,
    verbose: bool,
    registry: &Arc<Registry>,
) -> Result<(), ServerError>
where
    T: Transport + 'static,
    E: Evaluator,
{
    let control = transport.try_clone()?;
    let key = registry.next.fetch_add(1, Ordering::Relaxed);
    let peer = transport.peer();
    let cleanup = Arc::clone(registry);

    // Hold the table lock across spawn so the worker's own removal cannot
    // run before its entry exists
    let mut live = registry.live.lock();
    let worker = thread::Builder::new()
        .name("nrepl-conn".to_string())
        .spawn(move || {
            if let Err(e) = connection::serve(Box::new(transport), dispatcher, write_queue, verbose) {
                error!(peer = %peer, error = %e, "connection failed");
            }
            cleanup.live.lock().remove(&key);
        })?;
    live.insert(key, LiveConnection { control, worker });
    Ok(())
}

/// A running server. Dropping it stops the server.
pub struct ServerHandle<E: Evaluator> {
    local_addr: SocketAddr,
    unix_socket: Option<PathBuf>,
    sessions: Arc<SessionManager<E::Context>>,
    shutdown: Arc<AtomicBool>,
    registry: Arc<Registry>,
    acceptors: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl<E: Evaluator> ServerHandle<E> {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn unix_socket(&self) -> Option<&PathBuf> {
        self.unix_socket.as_ref()
    }

    pub fn sessions(&self) -> &Arc<SessionManager<E::Context>> {
        &self.sessions
    }

    pub fn connection_count(&self) -> usize {
        self.registry.live.lock().len()
    }

    /// Stop accepting, drop every connection, and close all sessions.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.store(true, Ordering::Release);
        for acceptor in self.acceptors.drain(..) {
            let _ = acceptor.join();
        }
        let connections = self.registry.drain();
        let count = connections.len();
        for mut conn in connections {
            let _ = conn.control.disconnect();
            let _ = conn.worker.join();
        }
        let sessions = self.sessions.close_all();
        info!(connections = count, sessions, "nREPL server stopped");
    }
}

impl<E: Evaluator> Drop for ServerHandle<E> {
    fn drop(&mut self) {
        self.stop();
    }
}
