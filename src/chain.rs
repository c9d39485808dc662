//! The dispatcher contract and the chain engine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Fault;
use crate::request::Request;
use crate::session::Session;

/// A unit of request-handling logic.
///
/// A dispatcher may mutate `session.view()`, replace the request body,
/// splice further dispatchers into the chain right after itself, or abort
/// the session. Returning `Ok(())` yields control to the next dispatcher;
/// returning a fault stops the chain and rejects the dispatch.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, request: &Request, session: &Session) -> Result<(), Fault>;
}

/// The ordered list of dispatchers executed for one request.
///
/// The cursor only moves forward, every dispatcher appears at most once,
/// and insertion immediately after the cursor is the only structural
/// mutation permitted while the chain runs.
#[derive(Default)]
pub struct Chain {
    state: Mutex<ChainState>,
}

#[derive(Default)]
struct ChainState {
    dispatchers: Vec<Arc<dyn Dispatcher>>,
    cursor: usize,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the dispatchers to execute, deduplicated by identity.
    /// Routers call this once before running the chain.
    pub fn prime(&self, dispatchers: impl IntoIterator<Item = Arc<dyn Dispatcher>>) {
        let mut state = self.state.lock().expect("chain state poisoned");
        state.dispatchers.clear();
        state.cursor = 0;
        for dispatcher in dispatchers {
            if !contains(&state.dispatchers, &dispatcher) {
                state.dispatchers.push(dispatcher);
            }
        }
    }

    /// Insert dispatchers immediately after the one currently executing.
    ///
    /// Anything already present anywhere in the chain is dropped, so a
    /// middleware splicing negotiated handlers can never create a cycle.
    pub fn splice(&self, dispatchers: impl IntoIterator<Item = Arc<dyn Dispatcher>>) {
        let mut state = self.state.lock().expect("chain state poisoned");
        let at = state.cursor;
        let mut inserted = 0;
        for dispatcher in dispatchers {
            if contains(&state.dispatchers, &dispatcher) {
                continue;
            }
            state.dispatchers.insert(at + inserted, dispatcher);
            inserted += 1;
        }
    }

    /// The cursor position: the index of the next dispatcher to run.
    pub fn index(&self) -> usize {
        self.state.lock().expect("chain state poisoned").cursor
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("chain state poisoned").dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Execute the chain: each dispatcher in order, awaiting each before
    /// advancing. Stops when the cursor passes the end, the session's
    /// abortion token fires, or a dispatcher faults.
    pub async fn run(&self, request: &Request, session: &Session) -> Result<(), Fault> {
        loop {
            if session.abortion().is_fired() {
                return Ok(());
            }
            let next = {
                let mut state = self.state.lock().expect("chain state poisoned");
                if state.cursor < state.dispatchers.len() {
                    let dispatcher = state.dispatchers[state.cursor].clone();
                    state.cursor += 1;
                    Some(dispatcher)
                } else {
                    None
                }
            };
            match next {
                Some(dispatcher) => dispatcher.dispatch(request, session).await?,
                None => return Ok(()),
            }
        }
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("chain state poisoned");
        f.debug_struct("Chain")
            .field("dispatchers", &state.dispatchers.len())
            .field("cursor", &state.cursor)
            .finish()
    }
}

fn contains(dispatchers: &[Arc<dyn Dispatcher>], candidate: &Arc<dyn Dispatcher>) -> bool {
    dispatchers
        .iter()
        .any(|present| Arc::ptr_eq(present, candidate))
}
