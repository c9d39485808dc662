//! The strict, dispatcher-facing façade over the outgoing response.

use std::sync::Mutex;

use bytes::Bytes;
use http::header::{HeaderName, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::body::Body;
use crate::error::Fault;

/// The fixed field set of the view façade.
pub const FIELDS: [&str; 4] = ["body", "headers", "status", "stream"];

fn application_json() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

fn text_event_stream() -> HeaderValue {
    HeaderValue::from_static("text/event-stream")
}

/// The outgoing-response model owned by a session and mutated by
/// dispatchers.
///
/// Four fields and nothing else: `body` (deep-merge assignment),
/// `headers` (write-through until flushed), `status`, and the lazily
/// constructed `stream`. The dynamic accessors [`View::read`] and
/// [`View::write`] enforce the field set and fail at the point of access
/// so chain error reports name the offending spot.
pub struct View {
    state: Mutex<ViewState>,
}

struct ViewState {
    body: Value,
    status: StatusCode,
    headers: HeaderMap,
    headers_sent: bool,
    ended: bool,
    reply: Option<oneshot::Sender<Response<Body>>>,
    events: Option<EventStream>,
}

/// A handle on the view's server-sent-event stream.
///
/// Every record written is serialized and framed as `data: <json>\n\n`.
/// All handles share one underlying channel; the stream ends once the
/// view is presented (or [`View::end_stream`] is called) and every
/// outstanding handle is dropped.
#[derive(Clone, Debug)]
pub struct EventStream {
    tx: mpsc::Sender<Bytes>,
}

impl EventStream {
    /// Frame and send one record.
    pub async fn write(&self, record: &Value) -> Result<(), Fault> {
        let json = serde_json::to_string(record).map_err(|e| {
            Fault::channel_transform_failed("an event record could not be encoded")
                .caused_by_text(e.to_string())
        })?;
        self.tx
            .send(Bytes::from(format!("data: {json}\n\n")))
            .await
            .map_err(|_| Fault::stream_closed("the event stream is no longer being read"))
    }

    /// Whether another handle writes into the same stream.
    pub fn same_stream(&self, other: &EventStream) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl View {
    pub(crate) fn new(reply: oneshot::Sender<Response<Body>>) -> Self {
        View {
            state: Mutex::new(ViewState {
                body: Value::Object(Map::new()),
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                headers_sent: false,
                ended: false,
                reply: Some(reply),
                events: None,
            }),
        }
    }

    // ---- body ----

    /// The current body aggregate.
    pub fn body(&self) -> Value {
        self.lock().body.clone()
    }

    /// Deep-merge a value into the body: maps merge key-wise and
    /// recursively, everything else overwrites.
    pub fn merge_body(&self, value: Value) {
        merge(&mut self.lock().body, value);
    }

    // ---- status ----

    pub fn status(&self) -> StatusCode {
        self.lock().status
    }

    pub fn set_status(&self, status: StatusCode) -> Result<(), Fault> {
        let mut state = self.lock();
        if state.headers_sent {
            return Err(Fault::property_not_writable("status", &FIELDS));
        }
        state.status = status;
        Ok(())
    }

    // ---- headers ----

    pub fn header(&self, name: &str) -> Option<HeaderValue> {
        self.lock().headers.get(name).cloned()
    }

    pub fn set_header(&self, name: &str, value: &str) -> Result<(), Fault> {
        let mut state = self.lock();
        if state.headers_sent {
            return Err(Fault::property_not_writable("headers", &FIELDS));
        }
        let name = name
            .parse::<HeaderName>()
            .map_err(|e| Fault::new(format!("invalid header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Fault::new(format!("invalid header value: {e}")))?;
        state.headers.insert(name, value);
        Ok(())
    }

    pub fn append_header(&self, name: &str, value: &str) -> Result<(), Fault> {
        let mut state = self.lock();
        if state.headers_sent {
            return Err(Fault::property_not_writable("headers", &FIELDS));
        }
        let name = name
            .parse::<HeaderName>()
            .map_err(|e| Fault::new(format!("invalid header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Fault::new(format!("invalid header value: {e}")))?;
        state.headers.append(name, value);
        Ok(())
    }

    pub fn remove_header(&self, name: &str) -> Result<(), Fault> {
        let mut state = self.lock();
        if state.headers_sent {
            return Err(Fault::property_not_writable("headers", &FIELDS));
        }
        state.headers.remove(name);
        Ok(())
    }

    /// The names of every header currently set.
    pub fn header_names(&self) -> Vec<HeaderName> {
        self.lock().headers.keys().cloned().collect()
    }

    /// Whether the response head has been flushed downstream; headers and
    /// status are read-only afterwards.
    pub fn headers_sent(&self) -> bool {
        self.lock().headers_sent
    }

    // ---- stream ----

    /// The server-sent-event stream, constructed on first access.
    ///
    /// Construction sets `content-type: text/event-stream` and flushes
    /// the response head, so it must happen before anything else sends
    /// headers. Later accesses return a handle on the same stream.
    pub fn stream(&self) -> Result<EventStream, Fault> {
        let mut state = self.lock();
        if let Some(events) = &state.events {
            return Ok(events.clone());
        }
        if state.ended {
            return Err(Fault::stream_closed("the response has already ended"));
        }
        if state.headers_sent {
            return Err(Fault::stream_closed(
                "the response head was flushed without a stream",
            ));
        }
        state.headers.insert(CONTENT_TYPE, text_event_stream());
        let (tx, rx) = mpsc::channel(16);
        let events = EventStream { tx };
        flush_head(&mut state, Body::channel(rx));
        state.events = Some(events.clone());
        Ok(events)
    }

    /// Close the event stream; no-op when none was constructed.
    pub fn end_stream(&self) {
        let mut state = self.lock();
        if state.events.take().is_some() {
            state.ended = true;
        }
    }

    // ---- dynamic accessors ----

    /// Read a field by name; names outside the fixed field set fail with
    /// a `PropertyNotReadable` fault.
    pub fn read(&self, name: &str) -> Result<Value, Fault> {
        match name {
            "body" => Ok(self.body()),
            "status" => Ok(Value::from(self.status().as_u16())),
            "headers" => {
                let state = self.lock();
                let mut headers = Map::new();
                for (name, value) in state.headers.iter() {
                    headers.insert(
                        name.as_str().to_string(),
                        Value::from(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                    );
                }
                Ok(Value::Object(headers))
            }
            "stream" => self.stream().map(|_| Value::Null),
            _ => Err(Fault::property_not_readable(name, &FIELDS)),
        }
    }

    /// Write a field by name; names outside the fixed field set, and the
    /// non-assignable `stream` slot, fail with a `PropertyNotWritable`
    /// fault.
    pub fn write(&self, name: &str, value: Value) -> Result<(), Fault> {
        match name {
            "body" => {
                self.merge_body(value);
                Ok(())
            }
            "status" => {
                let code = value
                    .as_u64()
                    .and_then(|n| u16::try_from(n).ok())
                    .and_then(|n| StatusCode::from_u16(n).ok())
                    .ok_or_else(|| Fault::property_not_writable(name, &FIELDS))?;
                self.set_status(code)
            }
            "headers" => match value {
                Value::Object(headers) => {
                    for (header, value) in headers {
                        let value = match value {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        self.set_header(&header, &value)?;
                    }
                    Ok(())
                }
                _ => Err(Fault::property_not_writable(name, &FIELDS)),
            },
            _ => Err(Fault::property_not_writable(name, &FIELDS)),
        }
    }

    // ---- presentation ----

    /// Present the view after a successful chain.
    ///
    /// No-op once the downstream has ended. When the head is not yet
    /// flushed the body is serialized as JSON (defaulting `content-type`
    /// to `application/json`) and the downstream ends with it; when the
    /// head went out through the event stream, the stream is closed.
    pub fn present(&self) {
        let mut state = self.lock();
        if state.ended {
            return;
        }
        if state.headers_sent {
            state.events = None;
            state.ended = true;
            return;
        }
        if !state.headers.contains_key(CONTENT_TYPE) {
            state.headers.insert(CONTENT_TYPE, application_json());
        }
        let payload =
            serde_json::to_vec(&state.body).unwrap_or_else(|_| b"{}".to_vec());
        flush_head(&mut state, Body::full(payload));
        state.ended = true;
    }

    /// Present a fault.
    ///
    /// No-op once the downstream has ended. Merges the fault's hint
    /// headers, takes its status (default 500) and ends the downstream
    /// with `{ status, error, code?, details? }`.
    pub fn present_error(&self, fault: &Fault) {
        let mut state = self.lock();
        if state.ended {
            return;
        }
        let status = fault.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let payload =
            serde_json::to_vec(&fault.to_body(status)).unwrap_or_else(|_| b"{}".to_vec());
        if state.headers_sent {
            // the head went out through the event stream; end it with the
            // serialized fault
            if let Some(events) = &state.events {
                if events.tx.try_send(Bytes::from(payload)).is_err() {
                    debug!("fault presentation dropped, event stream is full or gone");
                }
            }
            state.events = None;
            state.ended = true;
            return;
        }
        for (name, value) in fault.headers() {
            state.headers.insert(name.clone(), value.clone());
        }
        if !state.headers.contains_key(CONTENT_TYPE) {
            state.headers.insert(CONTENT_TYPE, application_json());
        }
        state.status = status;
        flush_head(&mut state, Body::full(payload));
        state.ended = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ViewState> {
        self.state.lock().expect("view state poisoned")
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("View")
            .field("status", &state.status)
            .field("headers_sent", &state.headers_sent)
            .field("ended", &state.ended)
            .finish()
    }
}

/// Hand the response head (and body source) to the transport. Sending can
/// only fail when the downstream already went away, in which case the
/// presentation is swallowed.
fn flush_head(state: &mut ViewState, body: Body) {
    let mut response = Response::new(body);
    *response.status_mut() = state.status;
    *response.headers_mut() = state.headers.clone();
    if let Some(reply) = state.reply.take() {
        if reply.send(response).is_err() {
            debug!("presentation dropped, downstream is gone");
        }
    }
    state.headers_sent = true;
}

fn merge(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(target), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match target.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, incoming) => *target = incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view() -> (View, oneshot::Receiver<Response<Body>>) {
        let (tx, rx) = oneshot::channel();
        (View::new(tx), rx)
    }

    #[test]
    fn partial_merges_equal_one_merged_write() {
        let (a, _rx_a) = view();
        a.merge_body(json!({"user": {"name": "ada"}}));
        a.merge_body(json!({"user": {"role": "admin"}, "ok": true}));
        a.merge_body(json!({"user": {"name": "grace"}}));

        let (b, _rx_b) = view();
        b.merge_body(json!({"user": {"name": "grace", "role": "admin"}, "ok": true}));

        assert_eq!(a.body(), b.body());
    }

    #[test]
    fn merge_overwrites_non_mapping_values() {
        let (view, _rx) = view();
        view.merge_body(json!({"list": [1, 2, 3], "n": 1}));
        view.merge_body(json!({"list": [4], "n": 2}));

        assert_eq!(view.body(), json!({"list": [4], "n": 2}));
    }

    #[test]
    fn unknown_fields_fail_at_the_point_of_access() {
        let (view, _rx) = view();

        let read = view.read("invalidAttribute").unwrap_err();
        assert_eq!(read.code(), Some(crate::codes::PROPERTY_NOT_READABLE));
        assert!(read.message().contains("body, headers, status, stream"));

        let write = view.write("invalidAttribute", json!(1)).unwrap_err();
        assert_eq!(write.code(), Some(crate::codes::PROPERTY_NOT_WRITABLE));
    }

    #[test]
    fn stream_slot_is_not_assignable() {
        let (view, _rx) = view();
        let fault = view.write("stream", json!({})).unwrap_err();
        assert_eq!(fault.code(), Some(crate::codes::PROPERTY_NOT_WRITABLE));
    }

    #[tokio::test]
    async fn stream_accesses_return_the_same_stream() {
        let (view, mut rx) = view();
        let first = view.stream().unwrap();
        let second = view.stream().unwrap();

        assert!(first.same_stream(&second));
        let response = rx.try_recv().unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
    }

    #[tokio::test]
    async fn present_writes_exactly_once() {
        let (view, mut rx) = view();
        view.merge_body(json!({"foo": "bar"}));
        view.present();
        view.present();
        view.present_error(&Fault::new("late"));

        let response = rx.try_recv().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn present_error_carries_status_headers_and_details() {
        let (view, mut rx) = view();
        let fault = Fault::new("Aborted")
            .with_code("E_TEST_ABORT")
            .with_status(StatusCode::SERVICE_UNAVAILABLE)
            .with_header("retry-after", "1")
            .caused_by(Fault::new("Abortion test").with_code("E_TEST_ABORT_CAUSE"));
        view.present_error(&fault);

        let response = rx.try_recv().unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "1");
    }

    #[test]
    fn headers_become_read_only_after_flush() {
        let (view, _rx) = view();
        view.present();

        let fault = view.set_header("x-late", "1").unwrap_err();
        assert_eq!(fault.code(), Some(crate::codes::PROPERTY_NOT_WRITABLE));
        let fault = view.set_status(StatusCode::ACCEPTED).unwrap_err();
        assert_eq!(fault.code(), Some(crate::codes::PROPERTY_NOT_WRITABLE));
    }
}
