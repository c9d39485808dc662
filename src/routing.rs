//! The router seam and the table router consumed by the test suite.
//!
//! Route-pattern matching is an external concern; this module defines the
//! contract a router fulfils and ships an exact-match table sufficient
//! for embedding and for the end-to-end tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::Dispatcher;
use crate::dispatch::{AcceptSelector, ContentTypeSelector, MethodSelector};
use crate::error::Fault;
use crate::request::Request;
use crate::session::Session;

/// Routes a request onto a primed dispatcher chain and runs it.
///
/// Implementations look up dispatchers for `request.criteria()`, install
/// them with [`Chain::prime`](crate::Chain::prime), run the chain, and
/// wrap any dispatcher fault in a `DispatchFailed` fault whose cause is
/// the dispatcher's own.
#[async_trait]
pub trait Router: Send + Sync + 'static {
    async fn dispatch(&self, request: &Request, session: &Session) -> Result<(), Fault>;
}

/// One route: a base dispatcher list plus negotiated entries keyed by the
/// reserved selector prefixes `method.<verb|*>`, `accept.<media>` and
/// `content-type.<media>`.
#[derive(Clone, Default)]
pub struct Route {
    base: Vec<Arc<dyn Dispatcher>>,
    methods: Vec<(String, Vec<Arc<dyn Dispatcher>>)>,
    accepts: Vec<(String, Vec<Arc<dyn Dispatcher>>)>,
    content_types: Vec<(String, Vec<Arc<dyn Dispatcher>>)>,
}

impl Route {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a dispatcher that always runs for this route.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.base.push(dispatcher);
        self
    }

    /// Register a dispatcher under a selector key. Keys without a
    /// reserved prefix land in the base list.
    pub fn on(mut self, key: &str, dispatcher: Arc<dyn Dispatcher>) -> Self {
        if let Some(verb) = key.strip_prefix("method.") {
            push_entry(&mut self.methods, &verb.to_ascii_lowercase(), dispatcher);
        } else if let Some(media) = key.strip_prefix("accept.") {
            push_entry(&mut self.accepts, &media.to_ascii_lowercase(), dispatcher);
        } else if let Some(media) = key.strip_prefix("content-type.") {
            push_entry(
                &mut self.content_types,
                &media.to_ascii_lowercase(),
                dispatcher,
            );
        } else {
            self.base.push(dispatcher);
        }
        self
    }

    pub(crate) fn method(&self, verb: &str) -> Option<&[Arc<dyn Dispatcher>]> {
        self.methods
            .iter()
            .find(|(entry, _)| entry == verb)
            .map(|(_, dispatchers)| dispatchers.as_slice())
    }

    pub(crate) fn methods(&self) -> &[(String, Vec<Arc<dyn Dispatcher>>)] {
        &self.methods
    }

    pub(crate) fn accepts(&self) -> &[(String, Vec<Arc<dyn Dispatcher>>)] {
        &self.accepts
    }

    pub(crate) fn content_types(&self) -> &[(String, Vec<Arc<dyn Dispatcher>>)] {
        &self.content_types
    }
}

fn push_entry(
    entries: &mut Vec<(String, Vec<Arc<dyn Dispatcher>>)>,
    key: &str,
    dispatcher: Arc<dyn Dispatcher>,
) {
    match entries.iter_mut().find(|(entry, _)| entry == key) {
        Some((_, dispatchers)) => dispatchers.push(dispatcher),
        None => entries.push((key.to_string(), vec![dispatcher])),
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("base", &self.base.len())
            .field("methods", &self.methods.len())
            .field("accepts", &self.accepts.len())
            .field("content_types", &self.content_types.len())
            .finish()
    }
}

/// An exact-match route table keyed by criteria strings.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<Route>>,
    separators: Option<String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route under a criteria key (trailing slashes are
    /// stripped, matching how request criteria are formed).
    pub fn route(mut self, criteria: &str, route: Route) -> Self {
        self.routes
            .insert(criteria.trim_end_matches('/').to_string(), Arc::new(route));
        self
    }

    /// Separator configuration passed through from the bootstrap options;
    /// the exact-match table has no use for it.
    pub fn separators(mut self, separators: impl Into<String>) -> Self {
        self.separators = Some(separators.into());
        self
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("separators", &self.separators)
            .finish()
    }
}

#[async_trait]
impl Router for RouteTable {
    async fn dispatch(&self, request: &Request, session: &Session) -> Result<(), Fault> {
        let route = self.routes.get(request.criteria()).ok_or_else(|| {
            Fault::no_route(format!("no route matches {:?}", request.criteria()))
        })?;

        let mut chain: Vec<Arc<dyn Dispatcher>> = Vec::new();
        if !route.methods().is_empty() {
            chain.push(Arc::new(MethodSelector::new(route.clone())));
        }
        if !route.accepts().is_empty() {
            chain.push(Arc::new(AcceptSelector::new(route.clone())));
        }
        if !route.content_types().is_empty() {
            chain.push(Arc::new(ContentTypeSelector::new(route.clone())));
        }
        chain.extend(route.base.iter().cloned());

        session.chain().prime(chain);
        session
            .chain()
            .run(request, session)
            .await
            .map_err(|fault| {
                Fault::dispatch_failed("a dispatcher rejected the request").caused_by(fault)
            })
    }
}
