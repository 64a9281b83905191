// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! One multiplexed connection to an EventStoreDB node.
//!
//! [`handshake`] splits a connection into a cloneable [`Connection`] handle
//! and a [`RequestDispatch`] actor that must be polled (usually spawned)
//! for any request to make progress. Public operations submit immutable
//! request descriptors over a command channel and suspend on per-request
//! completion handles; all engine and routing-table mutation happens inside
//! the actor.

pub(crate) mod dispatch;
pub(crate) mod in_flight_requests;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::prelude::*;
use http::uri::{Authority, Scheme};
use http::HeaderValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;
use tracing::Span;

pub use dispatch::RequestDispatch;

use crate::cancellations::{cancellations, RequestCancellation};
use crate::framing::DEFAULT_MAX_FRAME_LEN;
use crate::request::{DeliveryStatus, Disposition, Rpc};
use crate::subscription::SubscriptionHandle;
use crate::types::{ClientSettings, ClientSettingsParseError};
use crate::Error;

/// Settings that control the behavior of the connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// The number of requests that can be in flight at once.
    /// `max_in_flight_requests` controls the size of the routing table used
    /// by the connection for storing pending requests.
    pub max_in_flight_requests: usize,
    /// The number of requests that can be buffered client-side before being
    /// sent. `pending_request_buffer` controls the size of the channel
    /// callers use to communicate with the dispatch task.
    pub pending_request_buffer: usize,
    /// Initial HTTP/2 flow-control window of each stream.
    pub initial_stream_window_size: u32,
    /// Initial HTTP/2 flow-control window of the whole connection.
    pub initial_connection_window_size: u32,
    /// Ceiling on a single decoded gRPC message.
    pub max_frame_len: usize,
    /// Interval of connection-level keepalive pings; disabled when absent.
    pub keepalive_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_in_flight_requests: 1_000,
            pending_request_buffer: 100,
            initial_stream_window_size: 1 << 20,
            initial_connection_window_size: 1 << 22,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            keepalive_interval: None,
        }
    }
}

/// A connection handle and dispatch pair. The dispatch drives the sending
/// and receiving of requests and must be polled continuously or spawned.
pub struct NewConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// The new connection handle.
    pub connection: Connection,
    /// The connection's dispatch.
    pub dispatch: RequestDispatch<T>,
}

impl<T> NewConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Helper method to spawn the dispatch on the default executor.
    pub fn spawn(self) -> Connection {
        let dispatch = self
            .dispatch
            .unwrap_or_else(move |e| tracing::warn!("Connection broken: {e}"));
        tokio::spawn(dispatch);
        self.connection
    }
}

impl<T> std::fmt::Debug for NewConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "NewConnection")
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Performs the HTTP/2 handshake over `io` and returns the connection
/// handle / dispatch pair.
///
/// `io` is any byte stream the caller has already established (and secured,
/// when the settings call for TLS): the socket is exclusive to the returned
/// dispatch from here on.
pub async fn handshake<T>(
    config: Config,
    settings: &ClientSettings,
    io: T,
) -> Result<NewConnection<T>, Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (send_request, mut conn) = h2::client::Builder::new()
        .initial_window_size(config.initial_stream_window_size)
        .initial_connection_window_size(config.initial_connection_window_size)
        .handshake(io)
        .await
        .map_err(Error::from_h2)?;

    let keepalive = config.keepalive_interval.map(|period| {
        let pp = conn
            .ping_pong()
            .expect("ping_pong is taken once per connection");
        dispatch::Keepalive::new(pp, period)
    });

    let scheme = if settings.is_tls() {
        Scheme::HTTPS
    } else {
        Scheme::HTTP
    };
    let authority: Authority = settings
        .authority()
        .parse()
        .map_err(|_| Error::Settings(ClientSettingsParseError::InvalidHost(settings.host().to_string())))?;
    let authorization = settings
        .credentials()
        .map(|credentials| HeaderValue::from_str(&credentials.basic_auth()))
        .transpose()
        .map_err(|_| Error::Settings(ClientSettingsParseError::InvalidCredentials))?;

    let (to_dispatch, pending_requests) = mpsc::channel(config.pending_request_buffer);
    let (cancellation, canceled_requests) = cancellations();
    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

    Ok(NewConnection {
        connection: Connection {
            to_dispatch,
            cancellation,
            next_stream_id: Arc::new(AtomicU32::new(1)),
            connection_id,
        },
        dispatch: RequestDispatch::new(
            config,
            conn,
            send_request,
            pending_requests,
            canceled_requests,
            connection_id,
            scheme,
            authority,
            authorization,
            keepalive,
        ),
    })
}

/// A request staged for the dispatch task, which manages its lifecycle from
/// here on.
pub(crate) struct DispatchRequest {
    pub span: Span,
    /// The HTTP/2 stream id the request state will be keyed by. Allocated by
    /// the connection handle: odd and monotonically increasing.
    pub key: u32,
    pub rpc: Rpc,
    pub disposition: Disposition,
}

/// Handles communication from public operations to request dispatch.
#[derive(Clone, Debug)]
pub struct Connection {
    to_dispatch: mpsc::Sender<DispatchRequest>,
    /// Channel to send cancellations to the dispatch task.
    cancellation: RequestCancellation,
    /// The stream id to use for the next staged request.
    next_stream_id: Arc<AtomicU32>,
    connection_id: u64,
}

impl Connection {
    pub(crate) fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn next_key(&self) -> u32 {
        self.next_stream_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Submits a request with aggregate disposition and suspends until its
    /// terminal state: every response message, or the error that ended it.
    pub(crate) async fn call(&self, rpc: Rpc) -> Result<Vec<Bytes>, Error> {
        let (completion, mut response) = oneshot::channel();
        let key = self.next_key();
        // The guard is created before sending out the request; otherwise,
        // the response future could be dropped after the request is sent out
        // but before the guard is created, rendering the cancellation logic
        // inactive.
        let response_guard = ResponseGuard {
            response: &mut response,
            cancellation: &self.cancellation,
            key,
            cancel: true,
        };
        self.to_dispatch
            .send(DispatchRequest {
                span: Span::current(),
                key,
                rpc,
                disposition: Disposition::Aggregate { completion },
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        response_guard.response().await
    }

    /// Submits a request with iterator disposition: decoded messages arrive
    /// through the returned channel, whose capacity is the back-pressure
    /// credit. The channel closing without an error is the end of the
    /// stream; dropping the receiver cancels the request.
    pub(crate) async fn open_stream(
        &self,
        rpc: Rpc,
        credit: usize,
    ) -> Result<mpsc::Receiver<Result<Bytes, Error>>, Error> {
        // One extra slot so a terminal error always fits.
        let (items_tx, items_rx) = mpsc::channel(credit.saturating_add(1));
        let key = self.next_key();
        self.to_dispatch
            .send(DispatchRequest {
                span: Span::current(),
                key,
                rpc,
                disposition: Disposition::Iterator {
                    items: PollSender::new(items_tx.clone()),
                    items_direct: items_tx,
                },
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        Ok(items_rx)
    }

    /// Submits a request with push disposition and suspends until the server
    /// acknowledges the stream open, returning the subscription handle.
    pub(crate) async fn push(
        &self,
        rpc: Rpc,
        deliver: Box<dyn FnMut(Bytes) -> DeliveryStatus + Send>,
    ) -> Result<SubscriptionHandle, Error> {
        let (confirmed, mut confirmation) = oneshot::channel();
        let key = self.next_key();
        let response_guard = ResponseGuard {
            response: &mut confirmation,
            cancellation: &self.cancellation,
            key,
            cancel: true,
        };
        self.to_dispatch
            .send(DispatchRequest {
                span: Span::current(),
                key,
                rpc,
                disposition: Disposition::Push {
                    deliver,
                    confirmed: Some(confirmed),
                },
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        response_guard.response().await
    }

    /// Cancels the request keyed by `key`. Resolves once the dispatch task
    /// has acted on the cancellation, after which no further output is
    /// delivered for the request. Idempotent: cancelling an unknown or
    /// already-terminal request is `Ok`, as is cancelling on a dead
    /// connection.
    pub(crate) async fn cancel(&self, key: u32, timeout: Duration) -> Result<(), Error> {
        let ack = self.cancellation.cancel_with_ack(key);
        match tokio::time::timeout(timeout, ack).await {
            // An error here means the dispatch task is gone, and with it the
            // request: cancelled either way.
            Ok(_) => Ok(()),
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }
}

#[cfg(test)]
impl Connection {
    /// A handle wired to nothing, for state-machine tests.
    pub(crate) fn disconnected() -> Connection {
        let (to_dispatch, _) = mpsc::channel(1);
        let (cancellation, _) = cancellations();
        Connection {
            to_dispatch,
            cancellation,
            next_stream_id: Arc::new(AtomicU32::new(1)),
            connection_id: 0,
        }
    }
}

/// A completion that resolves when request dispatch delivers the request's
/// terminal state. Cancels the request when dropped unresolved.
struct ResponseGuard<'a, T> {
    response: &'a mut oneshot::Receiver<Result<T, Error>>,
    cancellation: &'a RequestCancellation,
    key: u32,
    cancel: bool,
}

impl<T> ResponseGuard<'_, T> {
    async fn response(mut self) -> Result<T, Error> {
        let response = (&mut *self.response).await;
        // Cancel drop logic once a response has been received.
        self.cancel = false;
        match response {
            Ok(response) => response,
            // The oneshot is Canceled when the dispatch task ends. In that
            // case, there's nothing listening on the other side, so there's
            // no point in propagating cancellation.
            Err(oneshot::error::RecvError { .. }) => Err(Error::Shutdown),
        }
    }
}

// Cancels the request when dropped, if not already complete.
impl<T> Drop for ResponseGuard<'_, T> {
    fn drop(&mut self) {
        // The receiver needs to be closed to handle the edge case that the
        // request has not yet been received by the dispatch task. It is
        // possible for the cancellation to arrive before the request itself,
        // in which case the request could get stuck in the routing table
        // forever if the server never responds. To avoid this, the dispatch
        // task checks if the receiver is closed before admitting the
        // request. By closing the receiver before sending the cancellation,
        // it is guaranteed that if the dispatch task misses an
        // early-arriving cancellation, then it will see the receiver as
        // closed.
        self.response.close();
        if self.cancel {
            self.cancellation.cancel(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellations::cancellations;
    use assert_matches::assert_matches;
    use futures_test::task::noop_context;
    use std::task::Poll;

    #[tokio::test]
    async fn response_guard_cancels_on_drop() {
        let (cancellation, mut canceled_requests) = cancellations();
        let (_, mut response) = oneshot::channel::<Result<(), Error>>();
        drop(ResponseGuard {
            response: &mut response,
            cancellation: &cancellation,
            key: 3,
            cancel: true,
        });
        // The guard's drop should have sent a cancellation.
        let cancellation = match canceled_requests.poll_recv(&mut noop_context()) {
            Poll::Ready(Some(c)) => c,
            other => panic!("unexpected poll result: {other:?}"),
        };
        assert_eq!(cancellation.key, 3);
    }

    #[tokio::test]
    async fn response_guard_does_not_cancel_after_response() {
        let (cancellation, mut canceled_requests) = cancellations();
        let (tx, mut response) = oneshot::channel();
        tx.send(Ok("done")).unwrap();
        let guard = ResponseGuard {
            response: &mut response,
            cancellation: &cancellation,
            key: 3,
            cancel: true,
        };
        assert_matches!(guard.response().await, Ok("done"));
        drop(cancellation);
        assert_matches!(
            canceled_requests.poll_recv(&mut noop_context()),
            Poll::Ready(None)
        );
    }

    #[tokio::test]
    async fn response_guard_maps_lost_dispatch_to_shutdown() {
        let (cancellation, _canceled_requests) = cancellations();
        let (tx, mut response) = oneshot::channel::<Result<(), Error>>();
        drop(tx);
        let guard = ResponseGuard {
            response: &mut response,
            cancellation: &cancellation,
            key: 1,
            cancel: true,
        };
        assert_matches!(guard.response().await, Err(Error::Shutdown));
    }

    #[test]
    fn stream_ids_are_odd_and_increasing() {
        let (to_dispatch, _rx) = mpsc::channel(1);
        let (cancellation, _canceled) = cancellations();
        let connection = Connection {
            to_dispatch,
            cancellation,
            next_stream_id: Arc::new(AtomicU32::new(1)),
            connection_id: 0,
        };
        let keys: Vec<u32> = (0..4).map(|_| connection.next_key()).collect();
        assert_eq!(keys, vec![1, 3, 5, 7]);
        assert!(keys.iter().all(|k| k % 2 == 1));
    }
}
