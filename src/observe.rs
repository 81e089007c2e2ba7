//! Flow accounting, response capture and event emission.
//!
//! Third link of the chain: by the time a request reaches this middleware it
//! has passed the denylist and carries a valid credential, so everything
//! seen here is legitimate-looking traffic worth learning from. The forward
//! observation is recorded before the handler runs (aborted requests are
//! still signal); the backward observation and the event fire when the
//! response body finishes — end of stream or client disconnect — counting
//! bytes as they pass through without buffering.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use http_body::{Frame, SizeHint};

use crate::events::{EventShipper, RequestEvent};
use crate::flow::FlowTracker;

/// Flat estimate for request headers, added on top of the content length.
pub const HEADER_OVERHEAD_BYTES: u64 = 500;

/// State for the observation middleware.
#[derive(Clone)]
pub struct ObserveState {
    pub tracker: Arc<FlowTracker>,
    pub shipper: Arc<EventShipper>,
}

/// Estimated request size: content length (0 when absent or unparseable)
/// plus the fixed header overhead.
pub fn request_size_estimate(headers: &HeaderMap) -> u64 {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    content_length + HEADER_OVERHEAD_BYTES
}

/// Record the forward observation, run the rest of the chain, and arrange
/// for backward accounting plus event shipping once the response completes.
pub async fn observe_middleware(
    State(state): State<ObserveState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let timestamp = Utc::now();

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let client_ip = crate::flow::client_key(request.headers(), peer);

    let request_size = request_size_estimate(request.headers());
    let method = request.method().to_string();
    let url = request.uri().to_string();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let protocol = format!("{:?}", request.version());

    let features = state.tracker.track_request(&client_ip, request_size);

    let response = next.run(request).await;
    let status = response.status().as_u16();

    let tracker = state.tracker.clone();
    let shipper = state.shipper.clone();
    let (parts, body) = response.into_parts();
    let counting = CountingBody::new(body, move |response_size| {
        let mut features = features;
        tracker.update_response_stats(&client_ip, response_size, &mut features);

        shipper.ship(RequestEvent {
            timestamp,
            client_ip,
            method,
            url,
            user_agent,
            status,
            duration_ms: start.elapsed().as_millis() as u64,
            request_size,
            response_size,
            protocol,
            features,
        });
    });

    Response::from_parts(parts, Body::new(counting))
}

/// Pass-through body that counts data bytes and invokes a completion hook
/// exactly once — on end of stream, on error, or on drop (cancellation),
/// whichever comes first. Nothing is buffered.
pub struct CountingBody {
    inner: Body,
    counted: u64,
    on_complete: Option<Box<dyn FnOnce(u64) + Send + 'static>>,
}

impl CountingBody {
    pub fn new(inner: Body, on_complete: impl FnOnce(u64) + Send + 'static) -> Self {
        Self {
            inner,
            counted: 0,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    fn finish(&mut self) {
        if let Some(hook) = self.on_complete.take() {
            hook(self.counted);
        }
    }
}

impl http_body::Body for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.counted += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        http_body::Body::size_hint(&self.inner)
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        // Client went away mid-response: whatever was written still counts
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn request_size_adds_header_overhead() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_size_estimate(&headers), HEADER_OVERHEAD_BYTES);

        headers.insert(header::CONTENT_LENGTH, "100".parse().unwrap());
        assert_eq!(request_size_estimate(&headers), 100 + HEADER_OVERHEAD_BYTES);

        headers.insert(header::CONTENT_LENGTH, "garbage".parse().unwrap());
        assert_eq!(request_size_estimate(&headers), HEADER_OVERHEAD_BYTES);
    }

    #[tokio::test]
    async fn counting_body_reports_bytes_once_on_completion() {
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let hook = {
            let seen = seen.clone();
            move |n| {
                seen.store(n, Ordering::SeqCst);
            }
        };

        let body = CountingBody::new(Body::from("hello world"), hook);
        let collected = BodyExt::collect(body).await.unwrap();
        assert_eq!(collected.to_bytes().as_ref(), b"hello world");
        assert_eq!(seen.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn counting_body_fires_hook_on_drop() {
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let hook = {
            let seen = seen.clone();
            move |n| {
                seen.store(n, Ordering::SeqCst);
            }
        };

        let body = CountingBody::new(Body::from("abandoned"), hook);
        drop(body);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
