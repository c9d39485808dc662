//! The response body type shared by unary presentations and event streams.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::BoxError;

/// A boxed response body.
///
/// Presentations produce either a complete buffer (the JSON rendering of
/// the view body or of a fault) or a channel-fed stream of pre-framed
/// event records; both are erased into this one type so the transport
/// serves a single body shape.
pub struct Body(UnsyncBoxBody<Bytes, BoxError>);

impl Body {
    /// An empty body.
    pub fn empty() -> Self {
        Self(Empty::new().map_err(|never| match never {}).boxed_unsync())
    }

    /// A complete body.
    pub fn full(data: impl Into<Bytes>) -> Self {
        Self(
            Full::new(data.into())
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
    }

    /// A body fed chunk-by-chunk from a channel; ends when every sender
    /// is gone.
    pub(crate) fn channel(rx: mpsc::Receiver<Bytes>) -> Self {
        let stream = ReceiverStream::new(rx).map(|chunk| Ok(Frame::data(chunk)));
        Self(StreamBody::new(stream).boxed_unsync())
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.0.size_hint()
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").finish()
    }
}
