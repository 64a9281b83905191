// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The routing table of requests already written to the connection, and the
//! per-request state machine that drives each of them.
//!
//! Every in-flight request is reachable from exactly one entry in the table;
//! removing the entry releases all of the request's resources (h2 stream
//! handles, decoder buffers, completion handles) in the same step.

use std::collections::{hash_map, VecDeque};
use std::mem;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use fnv::FnvHashMap;
use futures::Future;
use h2::client::ResponseFuture;
use h2::{FlowControl, Reason, RecvStream, SendStream};
use http::{header::CONTENT_TYPE, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;
use tokio_util::time::delay_queue::{self, DelayQueue};
use tracing::Span;

use crate::context::Context;
use crate::framing::{encode_frame, Frame, FrameDecoder};
use crate::request::{DeliveryStatus, Disposition, RequestBody};
use crate::status::{Code, Status};
use crate::subscription::SubscriptionHandle;
use crate::util::{Compact, TimeUntil};
use crate::Error;

/// Lifecycle of one HTTP/2 stream as seen by the request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamStatus {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamStatus {
    fn close_local(&mut self) {
        *self = match self {
            StreamStatus::Open | StreamStatus::HalfClosedLocal => StreamStatus::HalfClosedLocal,
            StreamStatus::HalfClosedRemote | StreamStatus::Closed => StreamStatus::Closed,
        };
    }

    fn close_remote(&mut self) {
        *self = match self {
            StreamStatus::Open | StreamStatus::HalfClosedRemote => StreamStatus::HalfClosedRemote,
            StreamStatus::HalfClosedLocal | StreamStatus::Closed => StreamStatus::Closed,
        };
    }
}

/// An error returned when an attempt is made to insert a request with a
/// stream id that is already in use.
#[derive(Debug)]
pub(crate) struct AlreadyExistsError;

/// Requests already written to the connection that haven't yet reached a
/// terminal state.
pub(crate) struct InFlightRequests {
    request_data: FnvHashMap<u32, RequestState>,
    deadlines: DelayQueue<u32>,
    /// Cancellations and completions that missed the table; expected when a
    /// cancellation races with server output.
    unroutable: u64,
}

impl Default for InFlightRequests {
    fn default() -> Self {
        InFlightRequests {
            request_data: FnvHashMap::default(),
            deadlines: DelayQueue::new(),
            unroutable: 0,
        }
    }
}

impl InFlightRequests {
    /// Returns the number of in-flight requests.
    pub fn len(&self) -> usize {
        self.request_data.len()
    }

    /// Returns true iff there are no requests in flight.
    pub fn is_empty(&self) -> bool {
        self.request_data.is_empty()
    }

    /// Starts a request, unless a request with the same stream id is already
    /// in flight.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_request(
        &mut self,
        key: u32,
        ctx: Context,
        span: Span,
        send: SendStream<Bytes>,
        response: ResponseFuture,
        body: RequestBody,
        disposition: Disposition,
        max_frame_len: usize,
    ) -> Result<(), AlreadyExistsError> {
        match self.request_data.entry(key) {
            hash_map::Entry::Vacant(vacant) => {
                let deadline_key = self.deadlines.insert(key, ctx.deadline.time_until());
                vacant.insert(RequestState {
                    span,
                    deadline_key: Some(deadline_key),
                    status: StreamStatus::Open,
                    send,
                    body: Some(body.into_iter()),
                    pending_chunk: None,
                    response: Some(response),
                    recv: None,
                    flow: None,
                    decoder: FrameDecoder::new(max_frame_len),
                    decoded: VecDeque::new(),
                    terminal: None,
                    disposition: DispositionState::new(disposition),
                });
                Ok(())
            }
            hash_map::Entry::Occupied(_) => Err(AlreadyExistsError),
        }
    }

    /// Cancels an in-flight request: resets the stream, completes the
    /// request with [`Error::Cancelled`] and releases its entry. Returns
    /// true iff the request was found; a miss only bumps the unroutable
    /// counter, since cancellations are expected to race with completions.
    pub fn cancel_request(&mut self, key: u32) -> bool {
        if let Some(mut state) = self.request_data.remove(&key) {
            self.request_data.compact(0.1);
            if let Some(deadline_key) = state.deadline_key.take() {
                self.deadlines.remove(&deadline_key);
            }
            state.abort(Error::Cancelled);
            true
        } else {
            self.unroutable += 1;
            tracing::debug!("No in-flight request found for stream id {key}.");
            false
        }
    }

    /// Yields a request that has expired, completing it with a timeout
    /// error and resetting its stream.
    pub fn poll_expired(&mut self, cx: &mut TaskContext<'_>) -> Poll<Option<u32>> {
        if self.deadlines.is_empty() {
            // TODO(https://github.com/tokio-rs/tokio/issues/4161)
            // This is a workaround for DelayQueue not always treating this case correctly.
            return Poll::Ready(None);
        }
        self.deadlines.poll_expired(cx).map(|expired| {
            let key = expired?.into_inner();
            if let Some(mut state) = self.request_data.remove(&key) {
                let span = state.span.clone();
                let _entered = span.enter();
                tracing::error!("DeadlineExceeded");
                self.request_data.compact(0.1);
                state.deadline_key = None;
                state.abort(Error::DeadlineExceeded);
            }
            Some(key)
        })
    }

    /// Drives every in-flight request state machine once, removing the ones
    /// that reached a terminal state. Ready iff any request completed.
    pub fn poll_states(&mut self, cx: &mut TaskContext<'_>, connection_id: u64) -> Poll<Option<()>> {
        let keys: Vec<u32> = self.request_data.keys().copied().collect();
        let mut completed = false;
        for key in keys {
            let Self {
                request_data,
                deadlines,
                ..
            } = self;
            if let Some(state) = request_data.get_mut(&key) {
                if state.poll(cx, key, connection_id, deadlines).is_ready() {
                    if let Some(mut state) = request_data.remove(&key) {
                        if let Some(deadline_key) = state.deadline_key.take() {
                            deadlines.remove(&deadline_key);
                        }
                    }
                    completed = true;
                }
            }
        }
        if completed {
            self.request_data.compact(0.1);
            Poll::Ready(Some(()))
        } else {
            Poll::Pending
        }
    }

    /// Drives every request to a terminal state with the given error and
    /// clears the table. Used on connection teardown.
    pub fn fail_all(&mut self, error: impl Fn() -> Error) {
        for (_, mut state) in self.request_data.drain() {
            state.deadline_key = None;
            state.abort(error());
        }
        self.deadlines.clear();
    }

    /// Number of cancellations and frames that missed the routing table.
    pub fn unroutable(&self) -> u64 {
        self.unroutable
    }
}

/// Delivery-side state, holding the completion handle appropriate to the
/// request's disposition.
enum DispositionState {
    Aggregate {
        completion: oneshot::Sender<Result<Vec<Bytes>, Error>>,
        messages: Vec<Bytes>,
    },
    Iterator {
        items: PollSender<Result<Bytes, Error>>,
        items_direct: mpsc::Sender<Result<Bytes, Error>>,
    },
    Push {
        deliver: Box<dyn FnMut(Bytes) -> DeliveryStatus + Send>,
        confirmed: Option<oneshot::Sender<Result<SubscriptionHandle, Error>>>,
    },
    /// The completion handle has been consumed.
    Done,
}

impl DispositionState {
    fn new(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Aggregate { completion } => DispositionState::Aggregate {
                completion,
                messages: Vec::new(),
            },
            Disposition::Iterator {
                items,
                items_direct,
            } => DispositionState::Iterator {
                items,
                items_direct,
            },
            Disposition::Push { deliver, confirmed } => {
                DispositionState::Push { deliver, confirmed }
            }
        }
    }
}

/// The state machine of one in-flight request.
pub(crate) struct RequestState {
    span: Span,
    deadline_key: Option<delay_queue::Key>,
    status: StreamStatus,
    // Write half.
    send: SendStream<Bytes>,
    body: Option<Box<dyn Iterator<Item = Bytes> + Send>>,
    pending_chunk: Option<Bytes>,
    // Read half.
    response: Option<ResponseFuture>,
    recv: Option<RecvStream>,
    flow: Option<FlowControl>,
    decoder: FrameDecoder,
    decoded: VecDeque<Frame>,
    /// Remote outcome once known: the gRPC status from trailers, or the
    /// fault that ended the request.
    terminal: Option<Result<Status, Error>>,
    disposition: DispositionState,
}

impl RequestState {
    /// Drives the request. Ready once the request has reached a terminal
    /// state and its completion handle has been resolved; the caller then
    /// removes the state from the table.
    fn poll(
        &mut self,
        cx: &mut TaskContext<'_>,
        key: u32,
        connection_id: u64,
        deadlines: &mut DelayQueue<u32>,
    ) -> Poll<()> {
        let span = self.span.clone();
        let _entered = span.enter();

        if self.terminal.is_none() {
            if let Err(e) = self.poll_send_body(cx) {
                return self.finish(Err(e));
            }
        }

        loop {
            match self.poll_deliver(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return self.finish(Err(e)),
                Poll::Pending => return Poll::Pending,
            }

            if let Some(outcome) = self.terminal.take() {
                return self.finish(outcome);
            }

            if let Some(mut response) = self.response.take() {
                match Pin::new(&mut response).poll(cx) {
                    Poll::Pending => {
                        self.response = Some(response);
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(resp)) => {
                        self.accept_response(resp, key, connection_id, deadlines);
                        continue;
                    }
                    Poll::Ready(Err(e)) => {
                        self.terminal = Some(Err(Error::from_h2(e)));
                        continue;
                    }
                }
            }

            let Some(recv) = self.recv.as_mut() else {
                return Poll::Pending;
            };
            match recv.poll_data(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    self.decoder.extend(&chunk);
                    loop {
                        match self.decoder.next_frame() {
                            Ok(Some(frame)) => self.decoded.push_back(frame),
                            Ok(None) => break,
                            Err(e) => {
                                self.terminal = Some(Err(Error::Decode(e)));
                                break;
                            }
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.status.close_remote();
                    self.terminal = Some(Err(Error::from_h2(e)));
                }
                Poll::Ready(None) => match recv.poll_trailers(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(trailers)) => {
                        self.status.close_remote();
                        let status = Status::from_trailers(trailers.unwrap_or_default());
                        self.terminal = Some(self.end_of_stream_outcome(status));
                    }
                    Poll::Ready(Err(e)) => {
                        self.status.close_remote();
                        self.terminal = Some(Err(Error::from_h2(e)));
                    }
                },
            }
        }
    }

    /// Validates response headers and switches to the streaming phase.
    fn accept_response(
        &mut self,
        resp: http::Response<RecvStream>,
        key: u32,
        connection_id: u64,
        deadlines: &mut DelayQueue<u32>,
    ) {
        let (parts, mut recv) = resp.into_parts();

        if parts.status != StatusCode::OK {
            let code = Code::from_http(parts.status);
            self.terminal = Some(Ok(Status::new(
                code,
                format!("unexpected HTTP status {}", parts.status),
            )));
            return;
        }

        let grpc_content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/grpc"));
        if !grpc_content_type {
            self.terminal = Some(Ok(Status::new(
                Code::Unknown,
                "response content-type is not application/grpc",
            )));
            return;
        }

        // Trailers-only response: the status rides in the headers.
        if recv.is_end_stream() {
            if let Some(status) = Status::from_header_status(&parts.headers) {
                self.status.close_remote();
                self.terminal = Some(Ok(status));
                return;
            }
        }

        self.flow = Some(recv.flow_control().clone());
        self.recv = Some(recv);

        // The server acknowledged the stream open. A confirmed subscription
        // runs until cancelled, so its deadline is disarmed here.
        if let DispositionState::Push { confirmed, .. } = &mut self.disposition {
            if let Some(confirmed) = confirmed.take() {
                let _ = confirmed.send(Ok(SubscriptionHandle::new(connection_id, key)));
                if let Some(deadline_key) = self.deadline_key.take() {
                    deadlines.remove(&deadline_key);
                }
            }
        }
    }

    /// Writes request-body frames while the stream has send capacity,
    /// half-closing the local side once the producer is exhausted.
    fn poll_send_body(&mut self, cx: &mut TaskContext<'_>) -> Result<(), Error> {
        loop {
            match self.pending_chunk.as_mut() {
                None => {
                    let Some(body) = self.body.as_mut() else {
                        return Ok(());
                    };
                    match body.next() {
                        Some(message) => self.pending_chunk = Some(encode_frame(&message)),
                        None => {
                            self.body = None;
                            self.send
                                .send_data(Bytes::new(), true)
                                .map_err(Error::from_h2)?;
                            self.status.close_local();
                            return Ok(());
                        }
                    }
                }
                Some(chunk) => {
                    self.send.reserve_capacity(chunk.len());
                    match self.send.poll_capacity(cx) {
                        Poll::Pending => return Ok(()),
                        Poll::Ready(None) => {
                            // No more capacity will ever be granted; the
                            // read half reports what happened.
                            self.body = None;
                            self.pending_chunk = None;
                            self.status.close_local();
                            return Ok(());
                        }
                        Poll::Ready(Some(Ok(0))) => continue,
                        Poll::Ready(Some(Ok(capacity))) => {
                            let take = capacity.min(chunk.len());
                            let data = chunk.split_to(take);
                            self.send.send_data(data, false).map_err(Error::from_h2)?;
                            if chunk.is_empty() {
                                self.pending_chunk = None;
                            }
                        }
                        Poll::Ready(Some(Err(e))) => return Err(Error::from_h2(e)),
                    }
                }
            }
        }
    }

    /// Hands decoded messages downstream in wire order, returning
    /// flow-control credit for each one only once it has been accepted.
    /// Pending means the consumer has no room: credit is withheld and the
    /// peer backs off.
    fn poll_deliver(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Error>> {
        while let Some(frame) = self.decoded.pop_front() {
            match &mut self.disposition {
                DispositionState::Aggregate { messages, .. } => messages.push(frame.payload),
                DispositionState::Iterator { items, .. } => match items.poll_reserve(cx) {
                    Poll::Pending => {
                        self.decoded.push_front(frame);
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(_)) => return Poll::Ready(Err(Error::Cancelled)),
                    Poll::Ready(Ok(())) => {
                        if items.send_item(Ok(frame.payload)).is_err() {
                            return Poll::Ready(Err(Error::Cancelled));
                        }
                    }
                },
                DispositionState::Push { deliver, .. } => match deliver(frame.payload) {
                    DeliveryStatus::Delivered => {}
                    DeliveryStatus::Unreachable => return Poll::Ready(Err(Error::Cancelled)),
                    DeliveryStatus::Failed(e) => return Poll::Ready(Err(Error::Decode(e))),
                },
                DispositionState::Done => {}
            }
            self.release_credit(frame.wire_len);
        }
        Poll::Ready(Ok(()))
    }

    fn release_credit(&mut self, wire_len: usize) {
        if let Some(flow) = self.flow.as_mut() {
            if let Err(e) = flow.release_capacity(wire_len) {
                tracing::debug!("failed to release {wire_len} bytes of stream credit: {e}");
            }
        }
    }

    fn end_of_stream_outcome(&self, status: Status) -> Result<Status, Error> {
        if self.decoder.is_idle() {
            Ok(status)
        } else {
            Err(Error::Decode(crate::framing::DecodeError::TruncatedFrame))
        }
    }

    /// Resolves the completion handle and marks the state closed.
    fn finish(&mut self, outcome: Result<Status, Error>) -> Poll<()> {
        let error = match outcome {
            Ok(status) if status.is_ok() => None,
            Ok(status) => Some(Error::Grpc(status)),
            Err(e) => Some(e),
        };
        if error.is_some() {
            // Best effort: the stream may be gone already.
            self.send.send_reset(Reason::CANCEL);
        }
        self.complete(error);
        Poll::Ready(())
    }

    /// Terminal handling used on cancellation, expiry and teardown paths.
    fn abort(&mut self, error: Error) {
        self.send.send_reset(Reason::CANCEL);
        self.complete(Some(error));
    }

    fn complete(&mut self, error: Option<Error>) {
        self.status = StreamStatus::Closed;
        // Undelivered messages are discarded for push subscribers and
        // preserved for aggregates via the status details.
        let undelivered: Vec<Bytes> = self.decoded.drain(..).map(|f| f.payload).collect();
        match mem::replace(&mut self.disposition, DispositionState::Done) {
            DispositionState::Aggregate {
                completion,
                mut messages,
            } => {
                let result = match error {
                    None => {
                        tracing::info!("ReceiveResponse");
                        Ok(messages)
                    }
                    Some(Error::Grpc(mut status)) => {
                        messages.extend(undelivered);
                        status.details = messages;
                        Err(Error::Grpc(status))
                    }
                    Some(e) => Err(e),
                };
                let _ = completion.send(result);
            }
            DispositionState::Iterator { items_direct, .. } => {
                if let Some(e) = error {
                    // Capacity is sized so a terminal message always fits;
                    // a full channel means the consumer is gone.
                    let _ = items_direct.try_send(Err(e));
                }
                // Dropping the sender ends the consumer's pulls.
            }
            DispositionState::Push { confirmed, .. } => {
                if let Some(confirmed) = confirmed {
                    let e = error.unwrap_or_else(|| {
                        Error::Grpc(Status::new(
                            Code::Unknown,
                            "stream ended before the subscription was confirmed",
                        ))
                    });
                    let _ = confirmed.send(Err(e));
                }
                // No synthetic message for confirmed subscribers: the
                // handle simply goes dead.
            }
            DispositionState::Done => {}
        }
    }
}
