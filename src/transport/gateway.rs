//! The gateway multiplexer: one listening socket, two protocol engines.

use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use socket2::TcpKeepalive;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::sniff::{sniff, Protocol, PREFACE_DEADLINE};
use super::tls::TlsAcceptor;
use crate::config::Options;
use crate::error::Fault;
use crate::lifecycle::{self, RequestScope};
use crate::routing::Router;
use crate::session::{connection_id, request_id, Stats};

/// The single accept-side listener multiplexing HTTP/1.1 and HTTP/2
/// (cleartext or TLS) onto one port.
///
/// Lifecycle: [`Gateway::bootstrap`] → [`Gateway::listen`] →
/// [`Gateway::close`]. Each accepted connection has its first bytes
/// peeked against the HTTP/2 client preface and is handed to the matching
/// protocol engine; the engines never touch the listener.
pub struct Gateway {
    state: Mutex<State>,
    stats: Arc<Stats>,
}

enum State {
    Bootstrapped(Box<Bootstrap>),
    Listening(Listening),
    Closed,
}

struct Bootstrap {
    router: Arc<dyn Router>,
    tls: Option<TlsAcceptor>,
    keep_alive_timeout: Duration,
    tcp_keepalive: Option<Duration>,
    mute: bool,
}

struct Listening {
    local_addr: SocketAddr,
    stop: watch::Sender<()>,
    accept_task: JoinHandle<()>,
    drain: Drain,
}

/// State shared by every connection of one gateway.
struct ConnShared {
    router: Arc<dyn Router>,
    stats: Arc<Stats>,
    tls: Option<TlsAcceptor>,
    keep_alive_timeout: Duration,
    tcp_keepalive: Option<Duration>,
    mute: bool,
}

/// One accepted transport connection.
struct Connection {
    id: String,
    requests: AtomicU64,
}

/// The live-connection registry.
///
/// Every served connection holds one receiver on the drain channel for
/// as long as it lives. Draining sends the shutdown signal, which each
/// connection loop answers with a graceful shutdown of its protocol
/// engine, and then waits for the last receiver to drop.
#[derive(Clone)]
struct Drain {
    signal: watch::Sender<()>,
}

impl Drain {
    fn new() -> Self {
        let (signal, _) = watch::channel(());
        Drain { signal }
    }

    fn watcher(&self) -> watch::Receiver<()> {
        self.signal.subscribe()
    }

    async fn drain(self) {
        let _ = self.signal.send(());
        self.signal.closed().await;
    }
}

impl Gateway {
    /// Bootstrap a gateway with the table router from the options.
    pub fn bootstrap(mut options: Options) -> Result<Self, Fault> {
        let routes = std::mem::take(&mut options.router.routes);
        Self::bootstrap_with_router(options, Arc::new(routes))
    }

    /// Bootstrap a gateway with an external router implementation.
    pub fn bootstrap_with_router(
        options: Options,
        router: Arc<dyn Router>,
    ) -> Result<Self, Fault> {
        let tls = match options.server.identity {
            Some(identity) => Some(TlsAcceptor::new(
                identity,
                options.server.min_version,
                options.server.max_version,
            )?),
            None => None,
        };
        Ok(Gateway {
            state: Mutex::new(State::Bootstrapped(Box::new(Bootstrap {
                router,
                tls,
                keep_alive_timeout: options.server.keep_alive_timeout,
                tcp_keepalive: options.server.tcp_keepalive,
                mute: options.log.mute,
            }))),
            stats: Arc::new(Stats::default()),
        })
    }

    /// The dispatch counters, shared with every connection.
    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Bind the address and start accepting.
    ///
    /// Only valid once bootstrapped and not yet listening; fails with a
    /// `NotAvailable` fault otherwise, and with the bind error when the
    /// address cannot be opened.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, Fault> {
        let mut state = self.state.lock().await;
        let bootstrap = match std::mem::replace(&mut *state, State::Closed) {
            State::Bootstrapped(bootstrap) => bootstrap,
            listening @ State::Listening(_) => {
                *state = listening;
                return Err(Fault::not_available("the gateway is already listening"));
            }
            State::Closed => {
                return Err(Fault::not_available("the gateway is not bootstrapped"));
            }
        };

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                *state = State::Bootstrapped(bootstrap);
                return Err(Fault::new(format!("could not bind {addr}"))
                    .caused_by_text(e.to_string()));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(e) => {
                *state = State::Bootstrapped(bootstrap);
                return Err(Fault::new("the bound address could not be resolved")
                    .caused_by_text(e.to_string()));
            }
        };

        let shared = Arc::new(ConnShared {
            router: bootstrap.router,
            stats: self.stats.clone(),
            tls: bootstrap.tls,
            keep_alive_timeout: bootstrap.keep_alive_timeout,
            tcp_keepalive: bootstrap.tcp_keepalive,
            mute: bootstrap.mute,
        });
        let (stop, stop_rx) = watch::channel(());
        let drain = Drain::new();
        let accept_task = tokio::spawn(accept_loop(listener, shared, stop_rx, drain.clone()));

        *state = State::Listening(Listening {
            local_addr,
            stop,
            accept_task,
            drain,
        });
        Ok(local_addr)
    }

    /// The bound address while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            State::Listening(listening) => Some(listening.local_addr),
            _ => None,
        }
    }

    /// Stop accepting and drain every live connection.
    ///
    /// Only valid while listening; fails with a `NotAvailable` fault
    /// otherwise.
    pub async fn close(&self) -> Result<(), Fault> {
        let listening = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, State::Closed) {
                State::Listening(listening) => listening,
                State::Bootstrapped(bootstrap) => {
                    *state = State::Bootstrapped(bootstrap);
                    return Err(Fault::not_available("the gateway is not listening"));
                }
                State::Closed => {
                    return Err(Fault::not_available("the gateway has been closed"));
                }
            }
        };

        let _ = listening.stop.send(());
        if let Err(e) = listening.accept_task.await {
            debug!("the accept loop ended abnormally: {e}");
        }
        listening.drain.drain().await;
        Ok(())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ConnShared>,
    mut stop: watch::Receiver<()>,
    drain: Drain,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                trace!("shutdown signal received, no longer accepting");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => {
                    trace!("connection accepted");
                    prepare_socket(&stream, shared.tcp_keepalive);
                    tokio::spawn(serve_connection(stream, shared.clone(), drain.watcher()));
                }
                Err(e) => trace!("error accepting connection: {e}"),
            }
        }
    }
}

fn prepare_socket(stream: &TcpStream, keepalive: Option<Duration>) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("error trying to set TCP_NODELAY: {e}");
    }
    if let Some(idle) = keepalive {
        let sock = socket2::SockRef::from(stream);
        if let Err(e) = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle)) {
            warn!("error trying to set TCP_KEEPALIVE: {e}");
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    shared: Arc<ConnShared>,
    watcher: watch::Receiver<()>,
) {
    match shared.tls.clone() {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => serve_protocols(stream, shared, watcher).await,
            Err(e) => debug!("TLS handshake failed: {e}"),
        },
        None => serve_protocols(stream, shared, watcher).await,
    }
}

/// Decide the protocol within the preface deadline and drive the matching
/// hyper engine until it finishes or the drain signal asks it to shut
/// down gracefully. Dropping the stream on a failed or timed-out decision
/// destroys the socket.
async fn serve_protocols<I>(io: I, shared: Arc<ConnShared>, mut watcher: watch::Receiver<()>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (protocol, io) = match timeout(PREFACE_DEADLINE, sniff(io)).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(e)) => {
            debug!("connection dropped during protocol detection: {e}");
            return;
        }
        Err(_) => {
            debug!("no protocol decision within the preface deadline, destroying the connection");
            return;
        }
    };

    let connection = Arc::new(Connection {
        id: connection_id(),
        requests: AtomicU64::new(0),
    });
    let io = TokioIo::new(io);
    let service = service_fn(move |inbound| {
        let shared = shared.clone();
        let connection = connection.clone();
        let index = connection.requests.fetch_add(1, Ordering::Relaxed) + 1;
        lifecycle::handle(
            RequestScope {
                router: shared.router.clone(),
                stats: shared.stats.clone(),
                protocol,
                request_id: request_id(&connection.id, index),
                keep_alive_timeout: shared.keep_alive_timeout,
                mute: shared.mute,
            },
            inbound,
        )
    });

    // The drain signal fires at most once; after answering it with a
    // graceful shutdown the loop only waits for the engine to finish.
    match protocol {
        Protocol::Http1 => {
            let mut conn = pin!(http1::Builder::new().serve_connection(io, service));
            let mut draining = false;
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            debug!("failed serving HTTP/1.1 connection: {e}");
                        }
                        break;
                    }
                    _ = watcher.changed(), if !draining => {
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        }
        Protocol::Http2 => {
            let mut builder = http2::Builder::new(TokioExecutor::new());
            builder.timer(TokioTimer::new());
            let mut conn = pin!(builder.serve_connection(io, service));
            let mut draining = false;
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            debug!("failed serving HTTP/2 connection: {e}");
                        }
                        break;
                    }
                    _ = watcher.changed(), if !draining => {
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        }
    }

    drop(watcher);
    trace!("connection closed");
}
