// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The immutable description of one RPC invocation, and the delivery
//! dispositions a request can be submitted with.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::PollSender;

use crate::context::Context;
use crate::framing::DecodeError;
use crate::subscription::SubscriptionHandle;
use crate::Error;

/// An RPC invocation: path, request body producer and deadline. Headers are
/// derived by the connection actor from the connection settings plus the
/// gRPC conventions (`POST`, `content-type: application/grpc+proto`,
/// `te: trailers`).
pub(crate) struct Rpc {
    pub path: &'static str,
    pub body: RequestBody,
    pub ctx: Context,
}

/// Producer of the request body: a single pre-encoded message for unary and
/// server-streaming calls, or a lazy sequence of encoded messages for
/// client-streaming calls. Consumed exactly once, by the actor.
pub(crate) enum RequestBody {
    Single(Bytes),
    Streaming(Box<dyn Iterator<Item = Bytes> + Send>),
}

impl RequestBody {
    pub(crate) fn into_iter(self) -> Box<dyn Iterator<Item = Bytes> + Send> {
        match self {
            RequestBody::Single(message) => Box::new(std::iter::once(message)),
            RequestBody::Streaming(messages) => messages,
        }
    }
}

/// Result of handing one decoded message to a push delivery callback.
pub(crate) enum DeliveryStatus {
    /// The message was delivered (or deliberately skipped).
    Delivered,
    /// The subscriber endpoint no longer exists.
    Unreachable,
    /// The message could not be decoded.
    Failed(DecodeError),
}

/// How a request's output reaches its caller.
pub(crate) enum Disposition {
    /// Collect every message and reply once, at terminal status.
    Aggregate {
        completion: oneshot::Sender<Result<Vec<Bytes>, Error>>,
    },
    /// Hand messages to a pull-based consumer through a bounded channel; the
    /// channel capacity is the back-pressure credit.
    Iterator {
        items: PollSender<Result<Bytes, Error>>,
        /// Same channel, used on abort paths where a poll-based reserve is
        /// not possible. Capacity is sized so a terminal message always
        /// fits.
        items_direct: mpsc::Sender<Result<Bytes, Error>>,
    },
    /// Invoke a delivery callback per message, synchronously in the actor.
    Push {
        deliver: Box<dyn FnMut(Bytes) -> DeliveryStatus + Send>,
        /// Resolved with the subscription handle as soon as the server
        /// acknowledges the stream open.
        confirmed: Option<oneshot::Sender<Result<SubscriptionHandle, Error>>>,
    },
}

impl Disposition {
    /// Whether the consumer of this request has already gone away, making
    /// submission pointless.
    pub(crate) fn is_closed(&self) -> bool {
        match self {
            Disposition::Aggregate { completion } => completion.is_closed(),
            Disposition::Iterator { items_direct, .. } => items_direct.is_closed(),
            Disposition::Push { confirmed, .. } => {
                confirmed.as_ref().is_some_and(|tx| tx.is_closed())
            }
        }
    }
}

impl std::fmt::Debug for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Aggregate { .. } => f.write_str("Aggregate"),
            Disposition::Iterator { .. } => f.write_str("Iterator"),
            Disposition::Push { .. } => f.write_str("Push"),
        }
    }
}
