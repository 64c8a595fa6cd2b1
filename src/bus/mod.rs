//! Bus adapters bridging connections to the shared publish/subscribe bus.
//!
//! Every accepted websocket is paired with two bus topics derived from its
//! connection id: [`topics::inbound`] (`conn.<id>`) carries client frames to
//! the backend, [`topics::outbound`] (`worker.<id>`) carries backend messages
//! to the client. Lifecycle is signaled on the inbound topic with the
//! [`SENTINEL_INIT`] and [`SENTINEL_CLOSED`] payloads.
//!
//! The [`Bus`] trait is the seam between the connection machinery and the
//! transport. [`redis::RedisBus`] is the production adapter;
//! [`memory::MemoryBus`] is an in-process adapter used by tests.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBus;
pub use self::redis::RedisBus;

use crate::error::BusError;
use bytes::Bytes;
use futures_util::Stream;
use std::future::Future;

/// Payload published on the inbound topic when a connection is established,
/// before any client frame. Lets backend workers react to a client that has
/// connected but not yet sent data.
pub const SENTINEL_INIT: &[u8] = b"init";

/// Payload published on the inbound topic when a connection has terminated.
pub const SENTINEL_CLOSED: &[u8] = b"closed";

/// Bus topic names for one connection.
///
/// Derivation is pure: the same id always yields the same topic strings, for
/// the connection's entire lifetime.
pub mod topics {
    use core::fmt::Display;

    /// Topic carrying client-to-backend traffic for the connection with the
    /// given id: `conn.<id>`.
    pub fn inbound(id: impl Display) -> String {
        format!("conn.{id}")
    }

    /// Topic carrying backend-to-client traffic for the connection with the
    /// given id: `worker.<id>`.
    pub fn outbound(id: impl Display) -> String {
        format!("worker.{id}")
    }
}

/// A message delivered by a bus subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// The concrete topic the message was published on. For pattern
    /// subscriptions this is the matching topic, not the pattern.
    pub topic: String,
    /// The message payload, forwarded verbatim.
    pub payload: Bytes,
}

/// A lazy sequence of bus messages. Ends when the underlying transport
/// closes or the subscription is released; the end of the sequence is
/// terminal, not transient.
pub trait BusStream: Stream<Item = BusMessage> + Send + Unpin + 'static {}

impl<T> BusStream for T where T: Stream<Item = BusMessage> + Send + Unpin + 'static {}

/// A connection to the message bus.
///
/// Implementations are cheap to clone and safe to share across every
/// connection in the process. Delivery is assumed reliable and in-order per
/// topic by the transport; this trait adds nothing on top.
pub trait Bus: Clone + Send + Sync + 'static {
    /// The stream type produced by [`Self::subscribe`] and
    /// [`Self::psubscribe`].
    type Subscription: BusStream;

    /// Publish `payload` on `topic`. Fire and forget: a returned error means
    /// the message was dropped, and callers are expected to log it rather
    /// than retry.
    fn publish(
        &self,
        topic: &str,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Subscribe to a single topic. The subscription is released by dropping
    /// the returned stream.
    fn subscribe(
        &self,
        topic: &str,
    ) -> impl Future<Output = Result<Self::Subscription, BusError>> + Send;

    /// Subscribe to every topic matching a redis-style glob pattern.
    fn psubscribe(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Self::Subscription, BusError>> + Send;
}

#[cfg(test)]
mod test {
    use super::topics;

    #[test]
    fn topic_derivation_is_stable() {
        assert_eq!(topics::inbound(7u64), "conn.7");
        assert_eq!(topics::outbound(7u64), "worker.7");
        // Same id, same strings, and string ids work for the worker side.
        assert_eq!(topics::inbound("7"), topics::inbound(7u64));
    }
}
