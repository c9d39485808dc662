use std::sync::Arc;

use async_trait::async_trait;
use http::header::ACCEPT;
use http::StatusCode;

use super::{media_matches, normalize_media};
use crate::chain::Dispatcher;
use crate::error::Fault;
use crate::request::Request;
use crate::routing::Route;
use crate::session::Session;

/// Splices the route entry negotiated against the request's `Accept`
/// header.
///
/// Client preferences are taken in header order; the first route entry
/// whose media type prefix-matches a preference (in either direction,
/// wildcard-tolerant) wins. No match fails with 406 and an `Accept`
/// header naming the supported set; a missing header fails 406 as well.
pub struct AcceptSelector {
    route: Arc<Route>,
}

impl AcceptSelector {
    pub fn new(route: Arc<Route>) -> Self {
        AcceptSelector { route }
    }

    fn supported(&self) -> String {
        self.route
            .accepts()
            .iter()
            .map(|(media, _)| media.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[async_trait]
impl Dispatcher for AcceptSelector {
    async fn dispatch(&self, request: &Request, session: &Session) -> Result<(), Fault> {
        let header = request
            .headers()
            .get(ACCEPT)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                Fault::header_missing("the request carries no accept header")
                    .with_status(StatusCode::NOT_ACCEPTABLE)
            })?;

        for preference in header.split(',').map(normalize_media) {
            for (supported, dispatchers) in self.route.accepts() {
                if media_matches(supported, &preference) {
                    session.chain().splice(dispatchers.iter().cloned());
                    return Ok(());
                }
            }
        }

        Err(Fault::no_route(format!(
            "none of the accepted media types are supported: {header}"
        ))
        .with_status(StatusCode::NOT_ACCEPTABLE)
        .with_header("accept", &self.supported()))
    }
}
