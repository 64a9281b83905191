// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides a request context that carries a deadline. The connection actor
//! enforces the deadline: a request that has not reached a terminal state by
//! its deadline is cancelled and its caller observes a timeout error.

use std::time::{Duration, SystemTime};

/// A request context carrying request-scoped information, i.e. the deadline.
///
/// The context is created by the public operation that submits the request
/// and travels with the request into the connection actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Context {
    /// When the caller expects the request to be complete by. The connection
    /// actor cancels the request if it is not complete by this time.
    pub deadline: SystemTime,
}

impl Default for Context {
    fn default() -> Self {
        current()
    }
}

fn ten_seconds_from_now() -> SystemTime {
    SystemTime::now() + Duration::from_secs(10)
}

/// Returns a context with the default deadline of ten seconds from now.
pub fn current() -> Context {
    Context {
        deadline: ten_seconds_from_now(),
    }
}

impl Context {
    /// Returns a context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Context {
            deadline: SystemTime::now() + timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deadline_is_in_the_future() {
        let ctx = current();
        assert!(ctx.deadline > SystemTime::now());
    }

    #[test]
    fn with_timeout_is_relative_to_now() {
        let ctx = Context::with_timeout(Duration::from_secs(60));
        assert!(ctx.deadline > SystemTime::now() + Duration::from_secs(50));
    }
}
