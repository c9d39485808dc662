//! Typed bootstrap options.
//!
//! Configuration file loading is an embedding concern; these builders are
//! what a loader (or plain code) produces.

use std::str::FromStr;
use std::time::Duration;

use crate::error::Fault;
use crate::routing::RouteTable;
use crate::transport::Identity;

const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a [`Gateway`](crate::Gateway) is bootstrapped with.
#[derive(Debug, Default)]
pub struct Options {
    pub server: ServerOptions,
    pub router: RouterOptions,
    pub log: LogOptions,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(mut self, server: ServerOptions) -> Self {
        self.server = server;
        self
    }

    pub fn router(mut self, router: RouterOptions) -> Self {
        self.router = router;
        self
    }

    pub fn log(mut self, log: LogOptions) -> Self {
        self.log = log;
        self
    }
}

/// Transport options. Presence of an identity switches the gateway into
/// TLS mode.
#[derive(Debug)]
pub struct ServerOptions {
    pub(crate) identity: Option<Identity>,
    pub(crate) min_version: Option<TlsVersion>,
    pub(crate) max_version: Option<TlsVersion>,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) tcp_keepalive: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            identity: None,
            min_version: None,
            max_version: None,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            tcp_keepalive: None,
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve TLS with this PEM identity.
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// The lowest TLS protocol version offered.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    /// The highest TLS protocol version offered.
    pub fn max_version(mut self, version: TlsVersion) -> Self {
        self.max_version = Some(version);
        self
    }

    /// The idle timeout advertised in the HTTP/1.1 `Keep-Alive` response
    /// header.
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Enable `TCP_KEEPALIVE` probes on accepted connections after the
    /// given idle time. Disabled by default.
    pub fn tcp_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.tcp_keepalive = keepalive;
        self
    }
}

/// The route table (and pass-through separator configuration) handed to
/// the router.
#[derive(Debug, Default)]
pub struct RouterOptions {
    pub(crate) routes: RouteTable,
}

impl RouterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }
}

/// Logging sink options.
#[derive(Debug, Default)]
pub struct LogOptions {
    pub(crate) mute: bool,
}

impl LogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress the per-request access events.
    pub fn mute(mut self, mute: bool) -> Self {
        self.mute = mute;
        self
    }
}

/// A TLS protocol version bound, parsed from the conventional
/// `TLSv1.2` / `TLSv1.3` strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = Fault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TLSv1.2" => Ok(TlsVersion::Tls12),
            "TLSv1.3" => Ok(TlsVersion::Tls13),
            other => Err(Fault::new(format!(
                "unrecognized TLS version {other:?}, expected TLSv1.2 or TLSv1.3"
            ))),
        }
    }
}
