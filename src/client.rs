// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The public operation surface: reads, appends, deletes and subscriptions
//! over one multiplexed connection.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;

use crate::connection::{handshake, Config, Connection};
use crate::context::Context;
use crate::framing::DecodeError;
use crate::reader::ReadStream;
use crate::request::{DeliveryStatus, RequestBody, Rpc};
use crate::streams::{self, AppendReq, AppendResp, DeleteReq, DeleteResp, ReadLimit, ReadReq, ReadResp};
use crate::subscription::{SubscriptionHandle, SubscriptionMessage, SubscriptionSink};
use crate::types::{
    AppendOptions, ClientSettings, DeleteOptions, Direction, EventData, Position, ReadOptions,
    ReadTarget, ResolvedEvent, SubscribeOptions, WriteResult,
};
use crate::Error;

/// An EventStoreDB client over a single multiplexed connection.
///
/// Cloning is cheap and clones share the connection.
#[derive(Clone, Debug)]
pub struct Client {
    connection: Connection,
}

impl Client {
    /// Connects to a single node and spawns its dispatch task.
    ///
    /// TLS termination is not provided here; hand an already-secured
    /// transport to [`crate::connection::handshake`] instead and wrap the
    /// resulting handle with [`Client::new`].
    pub async fn create(settings: ClientSettings) -> Result<Client, Error> {
        Self::create_with_config(Config::default(), settings).await
    }

    /// Like [`Client::create`], with explicit connection settings.
    pub async fn create_with_config(
        config: Config,
        settings: ClientSettings,
    ) -> Result<Client, Error> {
        if settings.is_tls() {
            return Err(Error::Connect(io::Error::new(
                io::ErrorKind::Unsupported,
                "tls termination must be provided externally",
            )));
        }
        let socket = TcpStream::connect((settings.host(), settings.port()))
            .await
            .map_err(Error::Connect)?;
        socket.set_nodelay(true).map_err(Error::Connect)?;
        let connection = handshake(config, &settings, socket).await?.spawn();
        Ok(Client { connection })
    }

    /// Wraps an already-established connection handle.
    pub fn new(connection: Connection) -> Client {
        Client { connection }
    }

    /// Reads a stream as a lazy, finite sequence of events, one chunk RPC
    /// at a time. `options.max_count` is the chunk size.
    pub fn read_stream(&self, stream_name: impl Into<String>, options: ReadOptions) -> ReadStream {
        ReadStream::new(
            self.connection.clone(),
            ReadTarget::Stream(stream_name.into()),
            options,
        )
    }

    /// Reads the global `$all` stream lazily.
    pub fn read_all(&self, options: ReadOptions) -> ReadStream {
        ReadStream::new(self.connection.clone(), ReadTarget::All, options)
    }

    /// Reads one bounded chunk of a stream: at most `options.max_count`
    /// events, collected into memory. Reading a missing or empty stream
    /// yields an empty sequence, never an error.
    #[tracing::instrument(skip_all)]
    pub async fn read_chunk(
        &self,
        stream_name: impl Into<String>,
        options: ReadOptions,
    ) -> Result<Vec<ResolvedEvent>, Error> {
        let responses = self
            .read_chunk_raw(stream_name, options)
            .await?;
        Ok(responses
            .into_iter()
            .filter_map(ResolvedEvent::from_read_response)
            .collect())
    }

    /// Like [`Client::read_chunk`], without the conversion to domain
    /// events: every raw read response, markers included.
    #[tracing::instrument(skip_all)]
    pub async fn read_chunk_raw(
        &self,
        stream_name: impl Into<String>,
        options: ReadOptions,
    ) -> Result<Vec<ReadResp>, Error> {
        let req = ReadReq {
            target: ReadTarget::Stream(stream_name.into()),
            from: options.from,
            direction: options.direction,
            resolve_links: options.resolve_links,
            limit: ReadLimit::Count(options.max_count.max(1)),
            filter: options.filter,
        };
        let rpc = Rpc {
            path: streams::path::READ,
            body: RequestBody::Single(req.encode()),
            ctx: request_context(options.timeout),
        };
        let messages = self.connection.call(rpc).await?;
        messages
            .iter()
            .map(|payload| ReadResp::decode(payload).map_err(Error::Decode))
            .collect()
    }

    /// Appends events to a stream, atomically evaluating the expectation in
    /// `options.expected`. A failed expectation surfaces as
    /// [`Error::WrongExpectedRevision`] and leaves the stream unchanged.
    #[tracing::instrument(skip_all)]
    pub async fn append<I>(
        &self,
        stream_name: impl Into<String>,
        events: I,
        options: AppendOptions,
    ) -> Result<WriteResult, Error>
    where
        I: IntoIterator<Item = EventData>,
        I::IntoIter: Send + 'static,
    {
        let options_frame = AppendReq::Options {
            stream_name: stream_name.into(),
            expected: options.expected,
        }
        .encode();
        let events = events
            .into_iter()
            .map(|event| AppendReq::Proposed(event.into_proposed()).encode());
        let body = std::iter::once(options_frame).chain(events);
        let rpc = Rpc {
            path: streams::path::APPEND,
            body: RequestBody::Streaming(Box::new(body)),
            ctx: request_context(options.timeout),
        };
        let messages = self.connection.call(rpc).await?;
        let resp = messages
            .first()
            .ok_or(Error::Decode(DecodeError::Message("AppendResp")))?;
        match AppendResp::decode(resp)? {
            AppendResp::Success {
                current_revision,
                position,
            } => Ok(WriteResult {
                current_revision,
                position,
            }),
            AppendResp::WrongExpectedVersion { current, expected } => {
                Err(Error::WrongExpectedRevision { expected, current })
            }
        }
    }

    /// Deletes a stream: soft by default, permanently when
    /// `options.tombstone` selects the Tombstone RPC.
    #[tracing::instrument(skip_all)]
    pub async fn delete(
        &self,
        stream_name: impl Into<String>,
        options: DeleteOptions,
    ) -> Result<Option<Position>, Error> {
        let path = if options.tombstone {
            streams::path::TOMBSTONE
        } else {
            streams::path::DELETE
        };
        let req = DeleteReq {
            stream_name: stream_name.into(),
            expected: options.expected,
        };
        let rpc = Rpc {
            path,
            body: RequestBody::Single(req.encode()),
            ctx: request_context(options.timeout),
        };
        let messages = self.connection.call(rpc).await?;
        let resp = messages
            .first()
            .ok_or(Error::Decode(DecodeError::Message("DeleteResp")))?;
        Ok(DeleteResp::decode(resp)?.position)
    }

    /// Subscribes to a stream: the subscriber sink receives one
    /// [`SubscriptionMessage`] per event, in wire order, until the
    /// subscription is cancelled or the connection dies. Resolves with the
    /// subscription handle once the server acknowledges the stream open.
    ///
    /// Delivery is a non-blocking send from the connection actor; the actor
    /// never waits on the subscriber. A subscriber that drops its receiver
    /// is detected before the next delivery and the subscription is
    /// silently cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn subscribe(
        &self,
        subscriber: SubscriptionSink,
        stream_name: impl Into<String>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, Error> {
        self.subscribe_target(subscriber, ReadTarget::Stream(stream_name.into()), options)
            .await
    }

    /// Subscribes to the global `$all` stream.
    #[tracing::instrument(skip_all)]
    pub async fn subscribe_to_all(
        &self,
        subscriber: SubscriptionSink,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, Error> {
        self.subscribe_target(subscriber, ReadTarget::All, options).await
    }

    async fn subscribe_target(
        &self,
        subscriber: SubscriptionSink,
        target: ReadTarget,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, Error> {
        let req = ReadReq {
            target,
            from: options.from,
            direction: Direction::Forwards,
            resolve_links: options.resolve_links,
            limit: ReadLimit::Subscription,
            filter: options.filter,
        };
        let rpc = Rpc {
            path: streams::path::READ,
            body: RequestBody::Single(req.encode()),
            ctx: request_context(options.timeout),
        };
        let raw = options.raw;
        let deliver = Box::new(move |payload: Bytes| -> DeliveryStatus {
            // Liveness probe before delivery.
            if subscriber.is_closed() {
                return DeliveryStatus::Unreachable;
            }
            let resp = match ReadResp::decode(&payload) {
                Ok(resp) => resp,
                Err(e) => return DeliveryStatus::Failed(e),
            };
            let message = if raw {
                SubscriptionMessage::Raw(resp)
            } else {
                match ResolvedEvent::from_read_response(resp) {
                    Some(event) => SubscriptionMessage::Event(event),
                    // Confirmations and checkpoints are not events.
                    None => return DeliveryStatus::Delivered,
                }
            };
            match subscriber.send(message) {
                Ok(()) => DeliveryStatus::Delivered,
                Err(_) => DeliveryStatus::Unreachable,
            }
        });
        self.connection.push(rpc, deliver).await
    }

    /// Cancels a subscription. Idempotent: cancelling an unknown, foreign
    /// or already-dead handle is `Ok`. Once this resolves, no further
    /// messages are delivered for the handle.
    #[tracing::instrument(skip_all)]
    pub async fn cancel_subscription(
        &self,
        handle: &SubscriptionHandle,
        timeout: Duration,
    ) -> Result<(), Error> {
        if handle.connection_id() != self.connection.connection_id() {
            // A handle from another connection is unknown here.
            return Ok(());
        }
        self.connection.cancel(handle.key(), timeout).await
    }
}

fn request_context(timeout: Option<Duration>) -> Context {
    timeout.map(Context::with_timeout).unwrap_or_default()
}
