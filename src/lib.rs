//! An embeddable HTTP server that multiplexes HTTP/1.1 and HTTP/2
//! (cleartext and TLS) on a single listening port.
//!
//! Every accepted connection has its first bytes peeked against the
//! HTTP/2 client connection preface and is routed to the matching
//! protocol engine. Every request is handed to a router that primes an
//! ordered, spliceable chain of [`Dispatcher`]s. Dispatchers cooperate by
//! mutating the session's [`View`]: deep-merging into its body, setting
//! headers and status, or writing server-sent events to its lazily
//! constructed stream. The view presents the final bytes once the chain
//! settles.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use portico::{
//!     config::{Options, RouterOptions},
//!     Dispatcher, Fault, Gateway, Request, Route, RouteTable, Session,
//! };
//! use serde_json::json;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Dispatcher for Hello {
//!     async fn dispatch(&self, _request: &Request, session: &Session) -> Result<(), Fault> {
//!         session.view().merge_body(json!({ "hello": "world" }));
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Fault> {
//!     let routes = RouteTable::new().route("/hello", Route::new().dispatcher(Arc::new(Hello)));
//!     let gateway = Gateway::bootstrap(
//!         Options::new().router(RouterOptions::new().routes(routes)),
//!     )?;
//!     gateway.listen("127.0.0.1:8080".parse().expect("address")).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;

mod body;
mod chain;
mod error;
mod lifecycle;
mod request;
mod routing;
mod session;
mod transport;
mod view;

pub use body::Body;
pub use chain::{Chain, Dispatcher};
pub use error::{codes, Cause, Fault};
pub use request::Request;
pub use routing::{Route, RouteTable, Router};
pub use session::{Abortion, Session, Stats};
pub use transport::{Certificate, Gateway, Identity};
pub use view::{EventStream, View, FIELDS};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
