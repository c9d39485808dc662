//! The inbound request model handed to dispatchers.

use bytes::Bytes;
use http::{request::Parts, HeaderMap, Method, Uri};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::error::Fault;

/// An inbound request.
///
/// Method, headers and URI are immutable snapshots of what the transport
/// parsed. The body starts out as a pending buffer filled by a background
/// task and may later be replaced with a decoded value by a middleware
/// dispatcher (see [`dispatch::JsonBody`](crate::dispatch::JsonBody)).
#[derive(Debug)]
pub struct Request {
    id: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    criteria: String,
    body: Mutex<BodyCell>,
}

#[derive(Debug)]
struct BodyCell {
    pending: Option<oneshot::Receiver<Result<Bytes, Fault>>>,
    bytes: Option<Bytes>,
    value: Option<Value>,
}

impl Request {
    pub(crate) fn new(
        id: String,
        parts: Parts,
        pending: oneshot::Receiver<Result<Bytes, Fault>>,
    ) -> Self {
        let criteria = criteria_of(&parts.uri);
        Request {
            id,
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            criteria,
            body: Mutex::new(BodyCell {
                pending: Some(pending),
                bytes: None,
                value: None,
            }),
        }
    }

    /// The request identifier, `<session id>.<request index>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The pathname with trailing slashes stripped; the key the router
    /// matches against.
    pub fn criteria(&self) -> &str {
        &self.criteria
    }

    /// The buffered request body.
    ///
    /// Awaits the background buffering the first time; later calls return
    /// the cached buffer. Fails with an `UpstreamClosed` fault when the
    /// upstream errored or went away before the body completed.
    pub async fn bytes(&self) -> Result<Bytes, Fault> {
        let mut cell = self.body.lock().await;
        if let Some(pending) = cell.pending.take() {
            let bytes = pending
                .await
                .unwrap_or_else(|_| {
                    Err(Fault::upstream_closed(
                        "the request body was never buffered",
                    ))
                })?;
            cell.bytes = Some(bytes);
        }
        Ok(cell.bytes.clone().unwrap_or_default())
    }

    /// The decoded body value, once a middleware has replaced the raw
    /// buffer.
    pub async fn value(&self) -> Option<Value> {
        self.body.lock().await.value.clone()
    }

    /// Replace the body with a decoded value.
    pub async fn set_value(&self, value: Value) {
        self.body.lock().await.value = Some(value);
    }
}

fn criteria_of(uri: &Uri) -> String {
    uri.path().trim_end_matches('/').to_string()
}
