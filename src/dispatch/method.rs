use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;

use crate::chain::Dispatcher;
use crate::error::Fault;
use crate::request::Request;
use crate::routing::Route;
use crate::session::Session;

/// Splices the route entry for the request's method, falling back to the
/// `method.*` entry. No entry fails the dispatch with 405 and an `Allow`
/// header naming every defined method.
pub struct MethodSelector {
    route: Arc<Route>,
}

impl MethodSelector {
    pub fn new(route: Arc<Route>) -> Self {
        MethodSelector { route }
    }
}

#[async_trait]
impl Dispatcher for MethodSelector {
    async fn dispatch(&self, request: &Request, session: &Session) -> Result<(), Fault> {
        let verb = request.method().as_str().to_ascii_lowercase();
        let entry = self.route.method(&verb).or_else(|| self.route.method("*"));

        match entry {
            Some(dispatchers) => {
                session.chain().splice(dispatchers.iter().cloned());
                Ok(())
            }
            None => {
                let mut allow: Vec<String> = self
                    .route
                    .methods()
                    .iter()
                    .filter(|(verb, _)| verb != "*")
                    .map(|(verb, _)| verb.to_ascii_uppercase())
                    .collect();
                allow.sort();
                allow.dedup();
                Err(Fault::no_route(format!(
                    "method {} is not allowed for this route",
                    request.method()
                ))
                .with_status(StatusCode::METHOD_NOT_ALLOWED)
                .with_header("allow", &allow.join(", ")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::View;
    use serde_json::json;
    use tokio::sync::oneshot;

    struct Marker(&'static str);

    #[async_trait]
    impl Dispatcher for Marker {
        async fn dispatch(&self, _request: &Request, session: &Session) -> Result<(), Fault> {
            session.view().merge_body(json!({ "ran": self.0 }));
            Ok(())
        }
    }

    fn fixtures(method: &str) -> (Request, Session) {
        let (parts, ()) = http::Request::builder()
            .method(method)
            .uri("/test")
            .body(())
            .unwrap()
            .into_parts();
        let (_tx, rx) = oneshot::channel();
        let request = Request::new("TEST.0001".into(), parts, rx);
        let (reply, _reply_rx) = oneshot::channel();
        let session = Session::new("TEST.0001".into(), View::new(reply));
        (request, session)
    }

    #[tokio::test]
    async fn exact_verb_wins_over_wildcard() {
        let route = Arc::new(
            Route::new()
                .on("method.get", Arc::new(Marker("get")))
                .on("method.*", Arc::new(Marker("any"))),
        );
        let (request, session) = fixtures("GET");
        session
            .chain()
            .prime([Arc::new(MethodSelector::new(route)) as Arc<dyn Dispatcher>]);
        session.chain().run(&request, &session).await.unwrap();

        assert_eq!(session.view().body(), json!({"ran": "get"}));
    }

    #[tokio::test]
    async fn unmatched_verb_fails_405_with_sorted_allow() {
        let route = Arc::new(
            Route::new()
                .on("method.post", Arc::new(Marker("post")))
                .on("method.get", Arc::new(Marker("get"))),
        );
        let (request, session) = fixtures("DELETE");
        let selector = MethodSelector::new(route);
        let fault = selector.dispatch(&request, &session).await.unwrap_err();

        assert_eq!(fault.status(), Some(StatusCode::METHOD_NOT_ALLOWED));
        assert_eq!(fault.code(), Some(crate::codes::NO_ROUTE));
        assert_eq!(fault.headers()["allow"], "GET, POST");
    }
}
