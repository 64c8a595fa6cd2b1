use super::{Bus, BusMessage};
use crate::error::BusError;
use bytes::Bytes;
use futures_util::{stream::BoxStream, StreamExt};
use redis::{aio::ConnectionManager, Client};

/// Production [`Bus`] adapter over a redis server.
///
/// Publishes go through a process-wide multiplexed connection; each publish
/// checks out a cheap clone of it, scoped to that one command. Every
/// subscription gets a dedicated pubsub connection, which the server tears
/// down when the returned stream is dropped.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
}

impl core::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisBus")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl RedisBus {
    /// Connect to the bus at `url`, e.g. `redis://127.0.0.1:6379`.
    ///
    /// Establishes the shared publishing connection eagerly, so a bus that is
    /// down at startup fails here rather than on the first publish.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = Client::open(url)?;
        let publisher = client.get_connection_manager().await?;
        Ok(Self { client, publisher })
    }

    async fn pubsub_stream(
        &self,
        channel: &str,
        pattern: bool,
    ) -> Result<BoxStream<'static, BusMessage>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        if pattern {
            pubsub.psubscribe(channel).await?;
        } else {
            pubsub.subscribe(channel).await?;
        }
        Ok(pubsub
            .into_on_message()
            .map(|msg| BusMessage {
                topic: msg.get_channel_name().to_owned(),
                payload: Bytes::from(msg.get_payload_bytes().to_vec()),
            })
            .boxed())
    }
}

impl Bus for RedisBus {
    type Subscription = BoxStream<'static, BusMessage>;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        let _: () = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload.as_ref())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Self::Subscription, BusError> {
        self.pubsub_stream(topic, false).await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Self::Subscription, BusError> {
        self.pubsub_stream(pattern, true).await
    }
}
