use async_trait::async_trait;
use serde_json::Value;

use crate::chain::Dispatcher;
use crate::error::Fault;
use crate::request::Request;
use crate::session::Session;

/// Decodes a buffered JSON request body and replaces `request.body` with
/// the decoded value. An empty body is a no-op; a body that is not valid
/// JSON fails the dispatch with 400.
#[derive(Debug, Default)]
pub struct JsonBody;

impl JsonBody {
    pub fn new() -> Self {
        JsonBody
    }
}

#[async_trait]
impl Dispatcher for JsonBody {
    async fn dispatch(&self, request: &Request, _session: &Session) -> Result<(), Fault> {
        let bytes = request.bytes().await?;
        if bytes.is_empty() {
            return Ok(());
        }
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
            Fault::invalid_body("the request body is not valid JSON")
                .caused_by_text(e.to_string())
        })?;
        request.set_value(value).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::View;
    use bytes::Bytes;
    use http::StatusCode;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn fixtures(body: &'static [u8]) -> (Request, Session) {
        let (parts, ()) = http::Request::builder()
            .uri("/test")
            .body(())
            .unwrap()
            .into_parts();
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(Bytes::from_static(body))).ok();
        let request = Request::new("TEST.0001".into(), parts, rx);
        let (reply, _reply_rx) = oneshot::channel();
        let session = Session::new("TEST.0001".into(), View::new(reply));
        (request, session)
    }

    #[tokio::test]
    async fn valid_json_replaces_the_body() {
        let (request, session) = fixtures(br#"{"foo": "bar"}"#);
        JsonBody::new().dispatch(&request, &session).await.unwrap();

        assert_eq!(request.value().await, Some(json!({"foo": "bar"})));
    }

    #[tokio::test]
    async fn empty_body_is_a_no_op() {
        let (request, session) = fixtures(b"");
        JsonBody::new().dispatch(&request, &session).await.unwrap();

        assert_eq!(request.value().await, None);
    }

    #[tokio::test]
    async fn invalid_json_fails_400() {
        let (request, session) = fixtures(b"{nope");
        let fault = JsonBody::new()
            .dispatch(&request, &session)
            .await
            .unwrap_err();

        assert_eq!(fault.status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(fault.code(), Some(crate::codes::INVALID_BODY));
    }
}
