//! Request correlation: matching asynchronous provider replies to the requests
//! which caused them.
//!
//! Each [`Session`](crate::registry::Session) owns one [`Correlator`], a table of
//! pending requests keyed by [`RequestId`]. Every operation takes the table lock
//! briefly and never awaits, so routing a frame for one request is never held up
//! by another request, however slow its renter.
//!
//! A pending request moves through
//! [`Sending`](RequestState::Sending) →
//! [`AwaitingResponseHeader`](RequestState::AwaitingResponseHeader) →
//! [`ResponseHeaderReceived`](RequestState::ResponseHeaderReceived) →
//! [`ResponseBodyStreaming`](RequestState::ResponseBodyStreaming) →
//! [`Completed`](RequestState::Completed), and may fail from any live state.
//! Resolution removes the entry from the table, so whichever event resolves a
//! request first wins and every later event for it finds nothing.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::body::{Body, BodySender, Response};
use crate::error::TunnelError;
use crate::frame::RequestId;
use crate::registry::SessionId;

/// Where a pending request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// The request frames are being written to the provider.
    Sending,
    /// The request has been sent; no response yet.
    AwaitingResponseHeader,
    /// The response head has been handed to the renter.
    ResponseHeaderReceived,
    /// Response body chunks are flowing.
    ResponseBodyStreaming,
    /// The response finished. Terminal.
    Completed,
    /// The request failed, timed out, or was cancelled. Terminal.
    Failed,
}

impl RequestState {
    fn awaiting_header(self) -> bool {
        matches!(self, Self::Sending | Self::AwaitingResponseHeader)
    }

    fn has_header(self) -> bool {
        matches!(
            self,
            Self::ResponseHeaderReceived | Self::ResponseBodyStreaming
        )
    }
}

/// A provider frame which could not be applied to the table.
///
/// These are never surfaced to renters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    /// No request with this id is pending, e.g. because it already timed out.
    #[error("no pending request {0}")]
    UnknownRequest(RequestId),

    /// The frame is not valid in the request's current state.
    #[error("{frame} frame for request {req_id} while {state:?}")]
    OutOfOrder {
        /// The request.
        req_id: RequestId,
        /// Kind of the offending frame.
        frame: &'static str,
        /// State of the request when the frame arrived.
        state: RequestState,
    },

    /// The renter stopped listening; the request has been dropped.
    #[error("renter abandoned request {0}")]
    Abandoned(RequestId),
}

type Head = oneshot::Sender<Result<Response, TunnelError>>;

/// The open response a pending request feeds.
#[derive(Debug)]
struct ResponseSink {
    head: Option<Head>,
    body: Option<BodySender>,
}

impl ResponseSink {
    fn fail(self, error: TunnelError) {
        if let Some(head) = self.head {
            let _ = head.send(Err(error));
        } else if let Some(body) = self.body {
            body.send_error(error);
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    state: RequestState,
    sink: ResponseSink,
    deadline: Instant,
    timer: Option<AbortHandle>,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    next_id: u64,
    pending: HashMap<RequestId, PendingRequest>,
    closed: Option<TunnelError>,
}

impl Table {
    fn allocate(&mut self) -> RequestId {
        loop {
            let id = RequestId::new(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn get_mut(&mut self, req_id: RequestId) -> Result<&mut PendingRequest, CorrelationError> {
        self.pending
            .get_mut(&req_id)
            .ok_or(CorrelationError::UnknownRequest(req_id))
    }
}

/// The table of requests pending on one session's provider channel.
pub struct Correlator {
    session: SessionId,
    table: Mutex<Table>,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("session", &self.session)
            .field("pending", &self.len())
            .finish()
    }
}

impl Correlator {
    /// Create an empty table for `session`.
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            table: Mutex::new(Table::default()),
        }
    }

    /// The session this table belongs to.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Register a new pending request, in the [`Sending`](RequestState::Sending)
    /// state, which fails with [`TunnelError::Timeout`] unless it completes
    /// within `timeout`.
    ///
    /// Returns the fresh request id and the future resolving to the response.
    /// Fails if the table has been closed because its channel went away.
    ///
    /// Must be called within a tokio runtime, which drives the deadline timer.
    pub fn begin(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<(RequestId, ResponseFuture), TunnelError> {
        let mut table = self.table.lock();
        if let Some(error) = &table.closed {
            return Err(error.clone());
        }

        let req_id = table.allocate();
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(correlator) = weak.upgrade() {
                correlator.on_timeout(req_id);
            }
        })
        .abort_handle();

        table.pending.insert(
            req_id,
            PendingRequest {
                state: RequestState::Sending,
                sink: ResponseSink {
                    head: Some(tx),
                    body: None,
                },
                deadline,
                timer: Some(timer),
            },
        );

        tracing::trace!(session = %self.session, %req_id, ?timeout, "request pending");
        Ok((req_id, ResponseFuture { rx }))
    }

    /// Record that the request has been fully written to the provider.
    ///
    /// Returns `false` if the request is no longer pending.
    pub fn mark_sent(&self, req_id: RequestId) -> bool {
        let mut table = self.table.lock();
        match table.pending.get_mut(&req_id) {
            Some(entry) => {
                if entry.state == RequestState::Sending {
                    self.transition(req_id, entry, RequestState::AwaitingResponseHeader);
                }
                true
            }
            None => false,
        }
    }

    /// Hand the response head to the renter.
    ///
    /// The response body is fed by later chunk frames.
    pub fn on_response_header(
        &self,
        req_id: RequestId,
        status: StatusCode,
        headers: HeaderMap,
    ) -> Result<(), CorrelationError> {
        let mut table = self.table.lock();
        let entry = table.get_mut(req_id)?;
        if !entry.state.awaiting_header() {
            return Err(self.out_of_order(req_id, "response_header", entry.state));
        }

        let (body_tx, body) = Body::channel();
        let mut response = http::Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        let delivered = entry
            .sink
            .head
            .take()
            .map(|head| head.send(Ok(response)).is_ok())
            .unwrap_or(false);

        if !delivered {
            self.remove(&mut table, req_id, RequestState::Failed);
            return Err(CorrelationError::Abandoned(req_id));
        }

        entry.sink.body = Some(body_tx);
        self.transition(req_id, entry, RequestState::ResponseHeaderReceived);
        Ok(())
    }

    /// Append a chunk to the response body.
    pub fn on_response_body_chunk(
        &self,
        req_id: RequestId,
        bytes: Bytes,
    ) -> Result<(), CorrelationError> {
        let mut table = self.table.lock();
        let entry = table.get_mut(req_id)?;
        if !entry.state.has_header() {
            return Err(self.out_of_order(req_id, "response_body_chunk", entry.state));
        }

        let sent = entry
            .sink
            .body
            .as_ref()
            .map(|body| body.send_data(bytes).is_ok())
            .unwrap_or(false);

        if !sent {
            self.remove(&mut table, req_id, RequestState::Failed);
            return Err(CorrelationError::Abandoned(req_id));
        }

        if entry.state != RequestState::ResponseBodyStreaming {
            self.transition(req_id, entry, RequestState::ResponseBodyStreaming);
        }
        Ok(())
    }

    /// Finish the response body and resolve the request.
    pub fn on_response_body_end(&self, req_id: RequestId) -> Result<(), CorrelationError> {
        let mut table = self.table.lock();
        let entry = table.get_mut(req_id)?;
        if !entry.state.has_header() {
            return Err(self.out_of_order(req_id, "response_body_end", entry.state));
        }

        // Dropping the body sender ends the body.
        self.remove(&mut table, req_id, RequestState::Completed);
        Ok(())
    }

    /// Fail the request with the provider's error message.
    pub fn on_provider_error(
        &self,
        req_id: RequestId,
        message: String,
    ) -> Result<(), CorrelationError> {
        if self.fail(req_id, TunnelError::Provider(message)) {
            Ok(())
        } else {
            Err(CorrelationError::UnknownRequest(req_id))
        }
    }

    /// Fail the request if its deadline has passed.
    ///
    /// Returns whether the request timed out.
    pub fn on_timeout(&self, req_id: RequestId) -> bool {
        let mut table = self.table.lock();
        let expired = table
            .pending
            .get(&req_id)
            .is_some_and(|entry| entry.deadline <= Instant::now());
        if !expired {
            return false;
        }

        tracing::debug!(session = %self.session, %req_id, "request timed out");
        if let Some(sink) = self.remove(&mut table, req_id, RequestState::Failed) {
            sink.fail(TunnelError::Timeout);
        }
        true
    }

    /// Fail a single request. Returns `false` if it was not pending.
    pub fn fail(&self, req_id: RequestId, error: TunnelError) -> bool {
        let sink = self.remove(&mut self.table.lock(), req_id, RequestState::Failed);
        match sink {
            Some(sink) => {
                tracing::debug!(session = %self.session, %req_id, %error, "request failed");
                sink.fail(error);
                true
            }
            None => false,
        }
    }

    /// Drop a request whose renter has gone away.
    ///
    /// Nothing is delivered to the renter. Returns `false` if it was not pending.
    pub fn cancel(&self, req_id: RequestId) -> bool {
        let sink = self.remove(&mut self.table.lock(), req_id, RequestState::Failed);
        match sink {
            Some(sink) => {
                tracing::debug!(session = %self.session, %req_id, "request cancelled");
                sink.fail(TunnelError::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `error` and close the table.
    ///
    /// Later calls to [`begin`](Self::begin) fail with the first error the table
    /// was closed with. Returns the number of requests failed.
    pub fn fail_all(&self, error: TunnelError) -> usize {
        let drained: Vec<_> = {
            let mut table = self.table.lock();
            if table.closed.is_none() {
                table.closed = Some(error.clone());
            }
            table.pending.drain().collect()
        };

        let count = drained.len();
        for (req_id, mut entry) in drained {
            tracing::trace!(session = %self.session, %req_id, from = ?entry.state, to = ?RequestState::Failed, "request state");
            entry.state = RequestState::Failed;
            let sink = std::mem::replace(
                &mut entry.sink,
                ResponseSink {
                    head: None,
                    body: None,
                },
            );
            sink.fail(error.clone());
        }

        if count > 0 {
            tracing::debug!(session = %self.session, %error, count, "failed pending requests");
        }
        count
    }

    /// The provider channel closed: fail everything with
    /// [`TunnelError::ProviderDisconnected`].
    pub fn on_channel_closed(&self) -> usize {
        self.fail_all(TunnelError::ProviderDisconnected)
    }

    /// Current state of a pending request.
    pub fn state(&self, req_id: RequestId) -> Option<RequestState> {
        self.table.lock().pending.get(&req_id).map(|entry| entry.state)
    }

    /// Whether the table has been closed to new requests.
    pub fn is_closed(&self) -> bool {
        self.table.lock().closed.is_some()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.table.lock().pending.len()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition(&self, req_id: RequestId, entry: &mut PendingRequest, to: RequestState) {
        tracing::trace!(session = %self.session, %req_id, from = ?entry.state, to = ?to, "request state");
        entry.state = to;
    }

    fn remove(&self, table: &mut Table, req_id: RequestId, to: RequestState) -> Option<ResponseSink> {
        let mut entry = table.pending.remove(&req_id)?;
        self.transition(req_id, &mut entry, to);
        Some(std::mem::replace(
            &mut entry.sink,
            ResponseSink {
                head: None,
                body: None,
            },
        ))
    }

    fn out_of_order(
        &self,
        req_id: RequestId,
        frame: &'static str,
        state: RequestState,
    ) -> CorrelationError {
        CorrelationError::OutOfOrder {
            req_id,
            frame,
            state,
        }
    }
}

/// Resolves to the provider's response for one pending request.
///
/// The response head arrives first; its body keeps streaming afterwards. If the
/// request is cancelled this resolves to [`TunnelError::Cancelled`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Response, TunnelError>>,
}

impl Future for ResponseFuture {
    type Output = Result<Response, TunnelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_) => Poll::Ready(Err(TunnelError::Cancelled)),
        }
    }
}
