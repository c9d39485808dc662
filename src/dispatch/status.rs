use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use crate::chain::Dispatcher;
use crate::error::Fault;
use crate::request::Request;
use crate::session::Session;
use crate::session::Stats;

/// Reports server liveness, uptime and the dispatch counters into the
/// view body.
pub struct StatusDispatcher {
    stats: Arc<Stats>,
    started: Instant,
}

impl StatusDispatcher {
    pub fn new(stats: Arc<Stats>) -> Self {
        StatusDispatcher {
            stats,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl Dispatcher for StatusDispatcher {
    async fn dispatch(&self, _request: &Request, session: &Session) -> Result<(), Fault> {
        session.view().merge_body(json!({
            "status": "up",
            "uptime": self.started.elapsed().as_secs(),
            "dispatched": self.stats.dispatched(),
            "completed": self.stats.completed(),
            "abortions": self.stats.abortions(),
            "rejections": self.stats.rejections(),
        }));
        Ok(())
    }
}
