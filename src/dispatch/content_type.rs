use std::sync::Arc;

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::StatusCode;

use super::{media_matches, normalize_media};
use crate::chain::Dispatcher;
use crate::error::Fault;
use crate::request::Request;
use crate::routing::Route;
use crate::session::Session;

/// Splices the route entry negotiated against the request's single
/// `Content-Type` header value. No match fails with 415, as does a
/// missing header.
pub struct ContentTypeSelector {
    route: Arc<Route>,
}

impl ContentTypeSelector {
    pub fn new(route: Arc<Route>) -> Self {
        ContentTypeSelector { route }
    }
}

#[async_trait]
impl Dispatcher for ContentTypeSelector {
    async fn dispatch(&self, request: &Request, session: &Session) -> Result<(), Fault> {
        let header = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                Fault::header_missing("the request carries no content-type header")
                    .with_status(StatusCode::UNSUPPORTED_MEDIA_TYPE)
            })?;

        let declared = normalize_media(header);
        for (supported, dispatchers) in self.route.content_types() {
            if media_matches(supported, &declared) {
                session.chain().splice(dispatchers.iter().cloned());
                return Ok(());
            }
        }

        Err(Fault::no_route(format!(
            "content type {header} is not supported"
        ))
        .with_status(StatusCode::UNSUPPORTED_MEDIA_TYPE))
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

    fn fixtures(content_type: Option<&str>) -> (Request, Session) {
        let mut builder = http::Request::builder().uri("/test");
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        let (_tx, rx) = oneshot::channel();
        let request = Request::new("TEST.0001".into(), parts, rx);
        let (reply, _reply_rx) = oneshot::channel();
        let session = Session::new("TEST.0001".into(), View::new(reply));
        (request, session)
    }

    fn route() -> Arc<Route> {
        Arc::new(Route::new().on("content-type.application/json", Arc::new(Marker("json"))))
    }

    #[tokio::test]
    async fn declared_type_selects_the_entry() {
        let (request, session) = fixtures(Some("application/json; charset=utf-8"));
        let selector = ContentTypeSelector::new(route());
        session
            .chain()
            .prime([Arc::new(selector) as Arc<dyn Dispatcher>]);
        session.chain().run(&request, &session).await.unwrap();

        assert_eq!(session.view().body(), json!({"ran": "json"}));
    }

    #[tokio::test]
    async fn unsupported_type_fails_415() {
        let (request, session) = fixtures(Some("application/xml"));
        let fault = ContentTypeSelector::new(route())
            .dispatch(&request, &session)
            .await
            .unwrap_err();

        assert_eq!(fault.status(), Some(StatusCode::UNSUPPORTED_MEDIA_TYPE));
        assert_eq!(fault.code(), Some(crate::codes::NO_ROUTE));
    }

    #[tokio::test]
    async fn missing_header_fails_415() {
        let (request, session) = fixtures(None);
        let fault = ContentTypeSelector::new(route())
            .dispatch(&request, &session)
            .await
            .unwrap_err();

        assert_eq!(fault.status(), Some(StatusCode::UNSUPPORTED_MEDIA_TYPE));
        assert_eq!(fault.code(), Some(crate::codes::HEADER_MISSING));
    }
}
