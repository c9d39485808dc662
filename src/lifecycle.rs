//! The per-request engine: builds the session, wires the transport
//! reactors, runs the router and routes the outcome into a presentation.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use http::header::{CONNECTION, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::body::Body;
use crate::error::{codes, Fault};
use crate::request::Request;
use crate::routing::Router;
use crate::session::{Abortion, Session, Stats};
use crate::transport::sniff::Protocol;
use crate::view::View;

/// Everything a single request is handled with.
pub(crate) struct RequestScope {
    pub(crate) router: Arc<dyn Router>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) protocol: Protocol,
    pub(crate) request_id: String,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) mute: bool,
}

/// Serve one request/response exchange.
///
/// The dispatch itself runs on its own task so that a downstream
/// disconnect never forcibly cancels a running dispatcher; this function
/// only waits for the presented response head. Dropping the wait (hyper
/// does when the peer goes away) fires the session's abortion token with
/// a `StreamClosed` fault.
pub(crate) async fn handle(
    scope: RequestScope,
    inbound: http::Request<Incoming>,
) -> Result<Response<Body>, Infallible> {
    let (parts, upstream) = inbound.into_parts();

    let (reply_tx, reply_rx) = oneshot::channel();
    let (bytes_tx, bytes_rx) = oneshot::channel();
    let request = Arc::new(Request::new(scope.request_id.clone(), parts, bytes_rx));
    let session = Arc::new(Session::new(scope.request_id, View::new(reply_tx)));

    if scope.protocol == Protocol::Http1 {
        echo_keep_alive(&request, &session, scope.keep_alive_timeout);
    }

    tokio::spawn(buffer_upstream(
        upstream,
        bytes_tx,
        session.abortion().clone(),
        request.id().to_string(),
    ));
    tokio::spawn(run(
        scope.router,
        scope.stats,
        request,
        session.clone(),
        scope.mute,
    ));

    let mut close_guard = CloseGuard {
        abortion: Some(session.abortion().clone()),
    };
    let response = match reply_rx.await {
        Ok(response) => response,
        Err(_) => {
            // the lifecycle task always presents; this is a last resort
            error!(code = codes::DOWNSTREAM_ERROR, "no presentation was produced");
            fallback_response()
        }
    };
    close_guard.disarm();
    Ok(response)
}

/// Run the dispatch and present its outcome.
async fn run(
    router: Arc<dyn Router>,
    stats: Arc<Stats>,
    request: Arc<Request>,
    session: Arc<Session>,
    mute: bool,
) {
    stats.record_dispatched();
    let outcome = router.dispatch(&request, &session).await;

    let abortion = session.abortion();
    if abortion.is_fired() {
        stats.record_abortion();
        match abortion.reason() {
            Some(fault) => {
                session.view().present_error(&fault);
                if !mute {
                    warn!(kind = "abort", request = %request.id(), "session aborted: {fault}");
                }
            }
            None => session.view().present(),
        }
    } else {
        match outcome {
            Ok(()) => {
                stats.record_completed();
                session.view().present();
            }
            Err(fault) => {
                stats.record_rejection();
                let presented = fault.cause_fault().unwrap_or(&fault);
                session.view().present_error(presented);
                error!(kind = "fail", request = %request.id(), "dispatch failed: {fault}");
            }
        }
    }

    if !mute {
        info!(
            status = session.view().status().as_u16(),
            method = %request.method(),
            path = request.uri().path(),
            request = %request.id(),
            "request finished"
        );
    }
}

/// Buffer the request body in the background; the receiver side lives in
/// [`Request::bytes`]. An upstream failure aborts the session and fails
/// the pending buffer.
async fn buffer_upstream(
    upstream: Incoming,
    bytes_tx: oneshot::Sender<Result<bytes::Bytes, Fault>>,
    abortion: Abortion,
    request_id: String,
) {
    match upstream.collect().await {
        Ok(collected) => {
            let _ = bytes_tx.send(Ok(collected.to_bytes()));
        }
        Err(e) => {
            debug!(code = codes::UPSTREAM_ERROR, request = %request_id, "request body failed: {e}");
            abortion.abort(Some(
                Fault::upstream_aborted("the upstream went away mid-request")
                    .caused_by_text(e.to_string()),
            ));
            let _ = bytes_tx.send(Err(Fault::upstream_closed(
                "the request body was interrupted",
            )));
        }
    }
}

/// `Connection: keep-alive` requests are answered with the verbatim echo
/// plus the advertised idle timeout; `Connection: close` gets neither.
fn echo_keep_alive(request: &Request, session: &Session, timeout: Duration) {
    let keep_alive = request
        .headers()
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("keep-alive"));
    if keep_alive {
        let view = session.view();
        view.set_header("connection", "keep-alive").ok();
        view.set_header("keep-alive", &format!("timeout={}", timeout.as_secs()))
            .ok();
    }
}

struct CloseGuard {
    abortion: Option<Abortion>,
}

impl CloseGuard {
    fn disarm(&mut self) {
        self.abortion = None;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(abortion) = self.abortion.take() {
            abortion.abort(Some(Fault::stream_closed(
                "the downstream closed before the response was presented",
            )));
        }
    }
}

fn fallback_response() -> Response<Body> {
    let fault = Fault::downstream_error("the response was never presented");
    let payload = serde_json::to_vec(&fault.to_body(StatusCode::INTERNAL_SERVER_ERROR))
        .unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Body::full(payload));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
    response
}
