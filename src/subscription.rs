// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Push-subscription surface: the opaque handle returned by `subscribe` and
//! the envelope delivered to the subscriber sink.
//!
//! The delivery callback runs inline in the connection actor and must not
//! block, so the sink is an unbounded sender: delivery is a non-blocking
//! send, preceded by a liveness probe on the sink. A subscriber that drops
//! its receiver is detected on the next delivery and the subscription is
//! silently cancelled with `RST_STREAM(CANCEL)`.

use std::cmp::Ordering;

use tokio::sync::mpsc;

use crate::streams::ReadResp;
use crate::types::ResolvedEvent;

/// Identifies one push subscription for cancellation.
///
/// A handle is a pure key: it holds no reference back to the connection.
/// Equality, ordering and hashing are by the request-state key.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionHandle {
    connection_id: u64,
    key: u32,
}

impl SubscriptionHandle {
    pub(crate) fn new(connection_id: u64, key: u32) -> Self {
        SubscriptionHandle { connection_id, key }
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub(crate) fn key(&self) -> u32 {
        self.key
    }
}

impl PartialEq for SubscriptionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for SubscriptionHandle {}

impl PartialOrd for SubscriptionHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SubscriptionHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl std::hash::Hash for SubscriptionHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// The envelope delivered to a subscriber for each subscription message.
/// The variant is the event marker distinguishing subscription output from
/// anything else the subscriber receives.
#[derive(Debug)]
pub enum SubscriptionMessage {
    /// A converted domain event.
    Event(ResolvedEvent),
    /// The raw read response, delivered when the subscription was opened
    /// with the `raw` option.
    Raw(ReadResp),
}

/// The delivery sink supplied at subscribe time.
pub type SubscriptionSink = mpsc::UnboundedSender<SubscriptionMessage>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_compare_by_key() {
        let a = SubscriptionHandle::new(1, 5);
        let b = SubscriptionHandle::new(2, 5);
        let c = SubscriptionHandle::new(1, 9);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }
}
