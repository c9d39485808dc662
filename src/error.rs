//! The crate-wide fault type and its stable code vocabulary.

use std::{error, fmt};

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::{Map, Value};

/// Stable `code` strings surfaced on faults and in error presentations.
///
/// Dispatchers are free to mint their own codes; these are the ones the
/// server itself raises.
pub mod codes {
    /// `listen` or `close` was invoked from the wrong lifecycle state.
    pub const NOT_AVAILABLE: &str = "E_HTTP_SERVER_NOT_AVAILABLE";
    /// The peer reset the request before the body completed.
    pub const UPSTREAM_ABORTED: &str = "E_HTTP_SERVER_UPSTREAM_ABORTED";
    /// The inbound transport surfaced an error.
    pub const UPSTREAM_ERROR: &str = "E_HTTP_SERVER_UPSTREAM_ERROR";
    /// The request body ended before it could be buffered.
    pub const UPSTREAM_CLOSED: &str = "E_HTTP_SERVER_UPSTREAM_CLOSED";
    /// The downstream closed before the response was presented.
    pub const STREAM_CLOSED: &str = "E_HTTP_SERVER_STREAM_CLOSED";
    /// The outbound transport surfaced an error.
    pub const DOWNSTREAM_ERROR: &str = "E_HTTP_SERVER_DOWNSTREAM_ERROR";
    /// A read of a view field outside the fixed field set.
    pub const PROPERTY_NOT_READABLE: &str = "E_HTTP_SERVER_VIEW_MODEL_PROPERTY_NOT_READABLE";
    /// A write to a view field outside the fixed field set, or to a
    /// non-writable slot.
    pub const PROPERTY_NOT_WRITABLE: &str = "E_HTTP_SERVER_VIEW_MODEL_PROPERTY_NOT_WRITABLE";
    /// An event-stream record could not be encoded.
    pub const CHANNEL_TRANSFORM_FAILED: &str =
        "E_HTTP_SERVER_VIEW_MODEL_CHANNEL_TRANSFORM_FAILED";
    /// No route (or negotiated route entry) matched the request.
    pub const NO_ROUTE: &str = "E_HTTP_SERVER_NO_ROUTE";
    /// A header required for negotiation was absent.
    pub const HEADER_MISSING: &str = "E_HTTP_SERVER_HEADER_MISSING";
    /// The request body could not be decoded.
    pub const INVALID_BODY: &str = "E_HTTP_SERVER_INVALID_BODY";
    /// A dispatcher rejected; the underlying fault is the cause.
    pub const DISPATCH_FAILED: &str = "E_HTTP_SERVER_DISPATCH_FAILED";
}

/// A fault raised anywhere between the transport and a dispatcher.
///
/// A fault carries a human message, an opaque `code` string, an optional
/// HTTP status override, hint headers merged into the response when the
/// fault is presented, and a cause chain that is rendered into the
/// `details` array of the error body.
#[derive(Debug, Clone, Default)]
pub struct Fault {
    message: String,
    code: Option<String>,
    status: Option<StatusCode>,
    headers: HeaderMap,
    cause: Option<Cause>,
}

/// What a fault was caused by.
#[derive(Debug, Clone)]
pub enum Cause {
    /// Another fault; rendered as `<code> - <message>` and recursed into.
    Fault(Box<Fault>),
    /// A list of causes, rendered in order.
    Many(Vec<Cause>),
    /// Free-form detail text.
    Text(String),
}

impl Fault {
    /// Create a fault with a message and nothing else.
    pub fn new(message: impl Into<String>) -> Self {
        Fault {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Attach a stable code string.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Override the HTTP status the fault presents with.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a hint header (e.g. `Allow` on a 405) merged into the
    /// response when the fault is presented. Invalid names or values are
    /// ignored rather than masking the fault being built.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Chain another fault as the cause.
    pub fn caused_by(mut self, cause: Fault) -> Self {
        self.cause = Some(Cause::Fault(Box::new(cause)));
        self
    }

    /// Chain free-form detail text as the cause.
    pub fn caused_by_text(mut self, detail: impl Into<String>) -> Self {
        self.cause = Some(Cause::Text(detail.into()));
        self
    }

    /// Chain an explicit cause value.
    pub fn with_cause(mut self, cause: Cause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    /// The fault chained as cause, if the cause is a fault.
    pub fn cause_fault(&self) -> Option<&Fault> {
        match &self.cause {
            Some(Cause::Fault(fault)) => Some(fault),
            _ => None,
        }
    }

    // ---- constructors for the server's own kinds ----

    pub fn not_available(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::NOT_AVAILABLE)
    }

    pub fn upstream_aborted(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::UPSTREAM_ABORTED)
    }

    pub fn upstream_error(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::UPSTREAM_ERROR)
    }

    pub fn upstream_closed(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::UPSTREAM_CLOSED)
    }

    pub fn stream_closed(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::STREAM_CLOSED)
    }

    pub fn downstream_error(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::DOWNSTREAM_ERROR)
    }

    pub fn property_not_readable(name: &str, fields: &[&str]) -> Self {
        Self::new(format!(
            "view property {name:?} is not readable, valid properties are {}",
            fields.join(", ")
        ))
        .with_code(codes::PROPERTY_NOT_READABLE)
        .with_status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn property_not_writable(name: &str, fields: &[&str]) -> Self {
        Self::new(format!(
            "view property {name:?} is not writable, valid properties are {}",
            fields.join(", ")
        ))
        .with_code(codes::PROPERTY_NOT_WRITABLE)
        .with_status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn channel_transform_failed(message: impl Into<String>) -> Self {
        Self::new(message)
            .with_code(codes::CHANNEL_TRANSFORM_FAILED)
            .with_status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn no_route(message: impl Into<String>) -> Self {
        Self::new(message)
            .with_code(codes::NO_ROUTE)
            .with_status(StatusCode::NOT_FOUND)
    }

    pub fn header_missing(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::HEADER_MISSING)
    }

    pub fn invalid_body(message: impl Into<String>) -> Self {
        Self::new(message)
            .with_code(codes::INVALID_BODY)
            .with_status(StatusCode::BAD_REQUEST)
    }

    pub fn dispatch_failed(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::DISPATCH_FAILED)
    }

    /// Render the cause chain into detail lines: faults become
    /// `<code> - <message>` and are recursed into, lists are walked in
    /// order, text is pushed verbatim. Cycles cannot form since causes
    /// are owned, so no visited set is needed.
    pub fn details(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(cause) = &self.cause {
            push_cause(cause, &mut out);
        }
        out
    }

    /// The JSON error body this fault presents as:
    /// `{ status, error, code?, details? }`.
    pub(crate) fn to_body(&self, status: StatusCode) -> Value {
        let mut body = Map::new();
        body.insert("status".into(), Value::from(status.as_u16()));
        body.insert("error".into(), Value::from(self.message.clone()));
        if let Some(code) = &self.code {
            body.insert("code".into(), Value::from(code.clone()));
        }
        let details = self.details();
        if !details.is_empty() {
            body.insert("details".into(), Value::from(details));
        }
        Value::Object(body)
    }
}

fn push_cause(cause: &Cause, out: &mut Vec<String>) {
    match cause {
        Cause::Fault(fault) => {
            let line = match fault.code() {
                Some(code) => format!("{} - {}", code, fault.message()),
                None => fault.message().to_string(),
            };
            out.push(line.trim().to_string());
            if let Some(inner) = &fault.cause {
                push_cause(inner, out);
            }
        }
        Cause::Many(list) => {
            for cause in list {
                push_cause(cause, out);
            }
        }
        Cause::Text(text) => out.push(text.clone()),
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code)?,
            None => write!(f, "{}", self.message)?,
        }
        for detail in self.details() {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl error::Error for Fault {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.cause_fault().map(|fault| fault as _)
    }
}
