// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Lazy, chunked stream reader.
//!
//! [`ReadStream`] reads an EventStore stream by issuing one server-streaming
//! Read RPC per chunk, pulling items out of the per-chunk channel on demand.
//! Consuming it is destructive, but it is referentially transparent with
//! respect to the store: a fresh reader over the same stream yields the same
//! sequence, modulo new appends.

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::context::Context;
use crate::request::{RequestBody, Rpc};
use crate::streams::{self, ReadLimit, ReadReq, ReadResp};
use crate::types::{Direction, FilterOptions, ReadOptions, ReadTarget, ResolvedEvent, StreamPosition};
use crate::Error;

/// Ceiling on the per-chunk delivery channel; beyond this, HTTP/2 flow
/// control is the effective back-pressure.
const MAX_CHUNK_CREDIT: usize = 4096;

/// The read cursor. `Initial` carries the caller's position untouched
/// (`Start`/`End` are inclusive on the first chunk only); every subsequent
/// chunk starts from an exclusive revision.
#[derive(Debug, Clone, Copy)]
enum Cursor {
    Initial(StreamPosition),
    Next(u64),
}

impl Cursor {
    fn position(self) -> StreamPosition {
        match self {
            Cursor::Initial(position) => position,
            Cursor::Next(revision) => StreamPosition::Revision(revision),
        }
    }
}

enum State {
    Idle,
    Opening(BoxFuture<'static, Result<mpsc::Receiver<Result<Bytes, Error>>, Error>>),
    Streaming {
        items: mpsc::Receiver<Result<Bytes, Error>>,
        received: u64,
    },
    Done,
}

/// A lazy, finite sequence of events, produced one chunk RPC at a time.
///
/// Ends after the first chunk that comes back short: a full chunk means
/// there may be more, anything less means the stream is exhausted. Errors
/// surface on the pull that would have produced the next item; items already
/// yielded remain valid. Dropping the reader cancels the in-flight chunk.
pub struct ReadStream {
    connection: Connection,
    target: ReadTarget,
    direction: Direction,
    cursor: Cursor,
    chunk_size: u64,
    resolve_links: bool,
    filter: Option<FilterOptions>,
    timeout: Option<Duration>,
    state: State,
}

impl ReadStream {
    pub(crate) fn new(connection: Connection, target: ReadTarget, options: ReadOptions) -> Self {
        ReadStream {
            connection,
            target,
            direction: options.direction,
            cursor: Cursor::Initial(options.from),
            chunk_size: options.max_count.max(1),
            resolve_links: options.resolve_links,
            filter: options.filter,
            timeout: options.timeout,
            state: State::Idle,
        }
    }

    fn chunk_request(&self) -> Rpc {
        let req = ReadReq {
            target: self.target.clone(),
            from: self.cursor.position(),
            direction: self.direction,
            resolve_links: self.resolve_links,
            limit: ReadLimit::Count(self.chunk_size),
            filter: self.filter.clone(),
        };
        Rpc {
            path: streams::path::READ,
            body: RequestBody::Single(req.encode()),
            ctx: self.timeout.map(Context::with_timeout).unwrap_or_default(),
        }
    }

    /// Server returns are treated as exclusive cursors for the next chunk,
    /// keeping cursor semantics monotonic in either direction.
    fn advance_cursor(&mut self, event: &ResolvedEvent) {
        match self.target {
            ReadTarget::Stream(_) => self.cursor = Cursor::Next(event.revision()),
            ReadTarget::All => {
                if let Some(commit) = event.commit_position {
                    self.cursor = Cursor::Next(commit);
                }
            }
        }
    }
}

impl Stream for ReadStream {
    type Item = Result<ResolvedEvent, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Done => return Poll::Ready(None),
                State::Idle => {
                    let rpc = this.chunk_request();
                    let connection = this.connection.clone();
                    let credit = usize::try_from(this.chunk_size)
                        .unwrap_or(MAX_CHUNK_CREDIT)
                        .min(MAX_CHUNK_CREDIT);
                    this.state = State::Opening(Box::pin(async move {
                        connection.open_stream(rpc, credit).await
                    }));
                }
                State::Opening(chunk) => match chunk.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(items)) => {
                        this.state = State::Streaming { items, received: 0 }
                    }
                    Poll::Ready(Err(e)) => {
                        this.state = State::Done;
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                State::Streaming { items, received } => match items.poll_recv(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Some(Ok(payload))) => {
                        let resp = match ReadResp::decode(&payload) {
                            Ok(resp) => resp,
                            Err(e) => {
                                this.state = State::Done;
                                return Poll::Ready(Some(Err(Error::Decode(e))));
                            }
                        };
                        match resp {
                            ReadResp::Event(_) => {
                                *received += 1;
                                let Some(event) = ResolvedEvent::from_read_response(resp) else {
                                    continue;
                                };
                                this.advance_cursor(&event);
                                return Poll::Ready(Some(Ok(event)));
                            }
                            ReadResp::StreamNotFound { .. } => {
                                this.state = State::Done;
                                return Poll::Ready(None);
                            }
                            // Confirmations and checkpoints are not items.
                            _ => {}
                        }
                    }
                    Poll::Ready(Some(Err(e))) => {
                        this.state = State::Done;
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Ready(None) => {
                        // A short chunk means the stream is exhausted; a
                        // full one means there may be more.
                        if *received < this.chunk_size {
                            this.state = State::Done;
                            return Poll::Ready(None);
                        }
                        this.state = State::Idle;
                    }
                },
            }
        }
    }
}
