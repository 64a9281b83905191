// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use tokio::sync::{mpsc, oneshot};

/// A cancellation signal for one in-flight request.
#[derive(Debug)]
pub(crate) struct Cancellation {
    /// The stream id of the request to cancel.
    pub key: u32,
    /// Present for explicit cancellations: resolved once the actor has
    /// removed the request, after which no further output can be delivered.
    pub ack: Option<oneshot::Sender<()>>,
}

/// Sends request cancellation signals.
#[derive(Debug, Clone)]
pub(crate) struct RequestCancellation(mpsc::UnboundedSender<Cancellation>);

/// A stream of requests that have been canceled.
#[derive(Debug)]
pub(crate) struct CanceledRequests(mpsc::UnboundedReceiver<Cancellation>);

/// Returns a channel to send request cancellation messages.
///
/// Unbounded because messages are sent in drop fns. This is fine, because the
/// volume is still bounded by the number of in-flight requests.
pub(crate) fn cancellations() -> (RequestCancellation, CanceledRequests) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RequestCancellation(tx), CanceledRequests(rx))
}

impl RequestCancellation {
    /// Cancels the request with the given stream id, without waiting for the
    /// actor to observe the cancellation.
    pub fn cancel(&self, key: u32) {
        let _ = self.0.send(Cancellation { key, ack: None });
    }

    /// Cancels the request and returns a receiver resolved once the actor
    /// has acted on the cancellation. The receiver yields an error if the
    /// actor is already gone, which callers treat as "already cancelled".
    pub fn cancel_with_ack(&self, key: u32) -> oneshot::Receiver<()> {
        let (ack, rx) = oneshot::channel();
        let _ = self.0.send(Cancellation {
            key,
            ack: Some(ack),
        });
        rx
    }
}

impl CanceledRequests {
    /// Polls for a cancelled request.
    pub fn poll_recv(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Cancellation>> {
        self.0.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_test::task::noop_context;
    use std::task::Poll;

    #[tokio::test]
    async fn cancel_reaches_the_receiver() {
        let (cancellation, mut canceled) = cancellations();
        cancellation.cancel(3);
        match canceled.poll_recv(&mut noop_context()) {
            Poll::Ready(Some(c)) => {
                assert_eq!(c.key, 3);
                assert!(c.ack.is_none());
            }
            other => panic!("unexpected poll result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ack_resolves_when_sent() {
        let (cancellation, mut canceled) = cancellations();
        let ack_rx = cancellation.cancel_with_ack(7);
        let c = match canceled.poll_recv(&mut noop_context()) {
            Poll::Ready(Some(c)) => c,
            other => panic!("unexpected poll result: {other:?}"),
        };
        c.ack.unwrap().send(()).unwrap();
        ack_rx.await.unwrap();
    }

    #[tokio::test]
    async fn ack_errors_when_receiver_is_gone() {
        let (cancellation, canceled) = cancellations();
        drop(canceled);
        let ack_rx = cancellation.cancel_with_ack(1);
        assert!(ack_rx.await.is_err());
    }
}
