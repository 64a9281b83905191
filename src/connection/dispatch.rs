// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The connection actor: a single task owning the HTTP/2 connection driver,
//! the request routing table and all timers. It processes socket progress,
//! user commands, cancellations and deadline expirations strictly serially;
//! public operations only ever talk to it through channels.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Future;
use h2::client::SendRequest;
use h2::{Ping, PingPong};
use http::header::{AUTHORIZATION, CONTENT_TYPE, TE};
use http::uri::{Authority, Scheme};
use http::{HeaderValue, Method, Request, Uri, Version};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};

use super::in_flight_requests::InFlightRequests;
use super::{Config, DispatchRequest};
use crate::cancellations::{CanceledRequests, Cancellation};
use crate::request::Disposition;
use crate::util::TimeUntil;
use crate::Error;

/// Connection-level keepalive: an interval PING with a missed-pong teardown.
pub(crate) struct Keepalive {
    pp: PingPong,
    interval: Interval,
    outstanding: bool,
}

impl Keepalive {
    pub(crate) fn new(pp: PingPong, period: Duration) -> Self {
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Keepalive {
            pp,
            interval,
            outstanding: false,
        }
    }

    fn poll(&mut self, cx: &mut TaskContext<'_>) -> Result<(), Error> {
        if self.outstanding {
            match self.pp.poll_pong(cx) {
                Poll::Ready(Ok(_)) => self.outstanding = false,
                Poll::Ready(Err(e)) => return Err(Error::from_h2(e)),
                Poll::Pending => {}
            }
        }
        while self.interval.poll_tick(cx).is_ready() {
            if self.outstanding {
                return Err(Error::Transport(Arc::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "keepalive ping timed out",
                ))));
            }
            self.pp.send_ping(Ping::opaque()).map_err(Error::from_h2)?;
            self.outstanding = true;
        }
        Ok(())
    }
}

/// Handles the lifecycle of requests: writes request frames to the
/// connection, routes incoming stream events to the matching request state,
/// and manages cancellations, deadlines and keepalive.
#[must_use]
#[pin_project]
pub struct RequestDispatch<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// The HTTP/2 connection driver; owned and polled by the actor so that
    /// all engine calls happen on the actor's execution context.
    #[pin]
    conn: h2::client::Connection<T, Bytes>,
    /// Opens new streams on the connection.
    send_request: SendRequest<Bytes>,
    /// Requests waiting to be written to the connection.
    pending_requests: mpsc::Receiver<DispatchRequest>,
    /// Requests that were cancelled or dropped.
    canceled_requests: CanceledRequests,
    /// Requests already written that haven't yet reached a terminal state.
    in_flight_requests: InFlightRequests,
    /// Configures limits to prevent unlimited resource usage.
    config: Config,
    connection_id: u64,
    scheme: Scheme,
    authority: Authority,
    authorization: Option<HeaderValue>,
    keepalive: Option<Keepalive>,
}

impl<T> RequestDispatch<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Config,
        conn: h2::client::Connection<T, Bytes>,
        send_request: SendRequest<Bytes>,
        pending_requests: mpsc::Receiver<DispatchRequest>,
        canceled_requests: CanceledRequests,
        connection_id: u64,
        scheme: Scheme,
        authority: Authority,
        authorization: Option<HeaderValue>,
        keepalive: Option<Keepalive>,
    ) -> Self {
        RequestDispatch {
            conn,
            send_request,
            pending_requests,
            canceled_requests,
            in_flight_requests: InFlightRequests::default(),
            config,
            connection_id,
            scheme,
            authority,
            authorization,
            keepalive,
        }
    }

    /// Polls the connection driver and the keepalive timer. Ready means the
    /// connection is finished, cleanly or not.
    fn pump_connection(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Result<(), Error>> {
        let this = self.project();
        if let Some(keepalive) = this.keepalive.as_mut() {
            if let Err(e) = keepalive.poll(cx) {
                return Poll::Ready(Err(e));
            }
        }
        this.conn.poll(cx).map_err(Error::from_h2)
    }

    /// Drives every in-flight request state machine.
    fn pump_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<()>> {
        let this = self.project();
        this.in_flight_requests.poll_states(cx, *this.connection_id)
    }

    fn pump_write(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<()>> {
        enum ReceiverStatus {
            Pending,
            Closed,
        }

        let pending_requests_status = match self.as_mut().poll_write_request(cx) {
            Poll::Ready(Some(())) => return Poll::Ready(Some(())),
            Poll::Ready(None) => ReceiverStatus::Closed,
            Poll::Pending => ReceiverStatus::Pending,
        };

        let canceled_requests_status = match self.as_mut().poll_write_cancel(cx) {
            Poll::Ready(Some(())) => return Poll::Ready(Some(())),
            Poll::Ready(None) => ReceiverStatus::Closed,
            Poll::Pending => ReceiverStatus::Pending,
        };

        // Receiving Poll::Ready(None) when polling expired requests never
        // indicates "Closed", because there can temporarily be zero requests
        // in flight.
        if let Poll::Ready(Some(_)) = self
            .as_mut()
            .project()
            .in_flight_requests
            .poll_expired(cx)
        {
            return Poll::Ready(Some(()));
        }

        match (pending_requests_status, canceled_requests_status) {
            (ReceiverStatus::Closed, ReceiverStatus::Closed) => Poll::Ready(None),
            _ => Poll::Pending,
        }
    }

    /// Admits the next pending request, if the engine is ready to open a
    /// stream and the in-flight table has room.
    fn poll_write_request(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<()>> {
        let this = self.project();

        if this.in_flight_requests.len() >= this.config.max_in_flight_requests {
            tracing::info!(
                "At in-flight request capacity ({}/{}).",
                this.in_flight_requests.len(),
                this.config.max_in_flight_requests
            );
            // No need to schedule a wakeup, because timers and responses are
            // responsible for clearing out in-flight requests.
            return Poll::Pending;
        }

        match this.send_request.poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => {
                // The connection driver reports the failure and tears the
                // actor down; nothing can be admitted anymore.
                tracing::debug!("stream handle errored: {e}");
                return Poll::Pending;
            }
            Poll::Ready(Ok(())) => {}
        }

        loop {
            let request = match this.pending_requests.poll_recv(cx) {
                Poll::Ready(Some(request)) => request,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };
            if request.disposition.is_closed() {
                let _entered = request.span.enter();
                tracing::info!("AbortRequest");
                continue;
            }

            let DispatchRequest {
                span,
                key,
                rpc,
                disposition,
            } = request;
            let _entered = span.enter();

            let timeout = rpc.ctx.deadline.time_until();
            let timeout_secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
            let request = Request::builder()
                .method(Method::POST)
                .version(Version::HTTP_2)
                .uri(
                    Uri::builder()
                        .scheme(this.scheme.clone())
                        .authority(this.authority.clone())
                        .path_and_query(rpc.path)
                        .build()
                        .expect("rpc paths are statically valid"),
                )
                .header(CONTENT_TYPE, "application/grpc+proto")
                .header(TE, "trailers")
                .header("grpc-timeout", format!("{timeout_secs}S"));
            let request = match this.authorization.as_ref() {
                Some(authorization) => request.header(AUTHORIZATION, authorization.clone()),
                None => request,
            };
            let request = request
                .body(())
                .expect("statically well-formed request headers");

            match this.send_request.send_request(request, false) {
                Ok((response, send)) => {
                    this.in_flight_requests
                        .insert_request(
                            key,
                            rpc.ctx,
                            span.clone(),
                            send,
                            response,
                            rpc.body,
                            disposition,
                            this.config.max_frame_len,
                        )
                        .expect("Stream ids should be unique");
                    tracing::info!("SendRequest");
                }
                Err(e) => {
                    complete_unsent(disposition, Error::Transport(Arc::new(e)));
                }
            }
            return Poll::Ready(Some(()));
        }
    }

    /// Acts on the next pending cancellation: resets the stream, releases
    /// the request state and acknowledges the cancellation. Idempotent;
    /// unknown stream ids are counted and acknowledged all the same.
    fn poll_write_cancel(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<()>> {
        let this = self.project();
        match this.canceled_requests.poll_recv(cx) {
            Poll::Ready(Some(Cancellation { key, ack })) => {
                if this.in_flight_requests.cancel_request(key) {
                    tracing::info!("CancelRequest");
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                Poll::Ready(Some(()))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Future for RequestDispatch<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        loop {
            if let Poll::Ready(result) = self.as_mut().pump_connection(cx) {
                // Connection-level failure (or close from under us): every
                // request still in flight becomes unavailable, the routing
                // table is cleared, and the actor terminates.
                let this = self.as_mut().project();
                let was_idle = this.in_flight_requests.is_empty();
                let clean = result.is_ok();
                let cause: Arc<dyn std::error::Error + Send + Sync> = match result {
                    Ok(()) => Arc::new(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection closed",
                    )),
                    Err(Error::Transport(cause)) => cause,
                    Err(e) => Arc::new(e),
                };
                this.in_flight_requests
                    .fail_all(|| Error::Transport(cause.clone()));
                tracing::info!(
                    unroutable = this.in_flight_requests.unroutable(),
                    "ConnectionClosed"
                );
                return if clean && was_idle {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(Error::Transport(cause)))
                };
            }

            match (self.as_mut().pump_read(cx), self.as_mut().pump_write(cx)) {
                (read, Poll::Ready(None)) => {
                    if self.in_flight_requests.is_empty() {
                        tracing::info!("Shutdown: write half closed, and no requests in flight.");
                        return Poll::Ready(Ok(()));
                    }
                    tracing::info!(
                        "Shutdown: write half closed, and {} requests in flight.",
                        self.in_flight_requests.len()
                    );
                    match read {
                        Poll::Ready(Some(())) => continue,
                        _ => return Poll::Pending,
                    }
                }
                (Poll::Ready(Some(())), _) | (_, Poll::Ready(Some(()))) => {}
                _ => return Poll::Pending,
            }
        }
    }
}

/// Completes a request that could not be written to the connection.
fn complete_unsent(disposition: Disposition, error: Error) {
    match disposition {
        Disposition::Aggregate { completion } => {
            let _ = completion.send(Err(error));
        }
        Disposition::Iterator { items_direct, .. } => {
            let _ = items_direct.try_send(Err(error));
        }
        Disposition::Push { confirmed, .. } => {
            if let Some(confirmed) = confirmed {
                let _ = confirmed.send(Err(error));
            }
        }
    }
}
