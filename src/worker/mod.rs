//! The demo backend worker: consumes client traffic from the `conn.*`
//! topics and answers on the matching `worker.<id>` topics.
//!
//! The worker holds no socket references at all. It reacts to the
//! gateway's lifecycle sentinels (`init` starts a per-connection keyspace
//! watcher that pushes a fresh user snapshot on every data change, `closed`
//! cancels it) and to business requests, which it decodes through a
//! minimal envelope before picking the full payload shape.

mod messages;
mod registry;
mod store;

pub use messages::{
    decode, ClientRequest, DecodeError, ListQuery, SetFavoriteNumber, User, UserListReply,
    CMD_LIST_ALL_USERS, CMD_SET_FAVORITE_NUMBER, REPLY_ALL_USERS,
};

use crate::{
    bus::{topics, Bus, BusMessage, RedisBus, SENTINEL_CLOSED, SENTINEL_INIT},
    error::BusError,
    tasks::TaskSet,
};
use redis::aio::{ConnectionLike, ConnectionManager as RedisConn};
use registry::WatchRegistry;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, instrument, warn};

/// Pattern covering the inbound topic of every gateway connection.
const CONN_PATTERN: &str = "conn.*";

/// Data-store change-notification pattern for user records. Requires the
/// store to have keyspace notifications enabled
/// (`notify-keyspace-events "Kh$"` or broader).
const KEYSPACE_PATTERN: &str = "*keyspace*:user:*";

/// The backend worker process state.
///
/// Generic over the [`Bus`] and the store connection, so a worker can run
/// in-process over a [`crate::bus::MemoryBus`]; [`Worker::connect`] builds
/// the production pairing of both onto one redis server.
#[derive(Clone)]
pub struct Worker<B: Bus = RedisBus, C = RedisConn> {
    bus: B,
    store: C,
    registry: Arc<WatchRegistry>,
    tasks: TaskSet,
}

impl<B: Bus + core::fmt::Debug, C> core::fmt::Debug for Worker<B, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("bus", &self.bus)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Connect the worker's bus and store connections to the redis server
    /// at `url`.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let bus = RedisBus::connect(url).await?;
        let store = redis::Client::open(url)?.get_connection_manager().await?;
        Ok(Self::new(bus, store))
    }
}

impl<B, C> Worker<B, C>
where
    B: Bus,
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    /// Build a worker over an already-connected bus and store.
    pub fn new(bus: B, store: C) -> Self {
        Self {
            bus,
            store,
            registry: Arc::default(),
            tasks: TaskSet::default(),
        }
    }

    /// Run the worker: subscribe `conn.*` and process every message on its
    /// own task. Returns when the subscription ends.
    pub async fn run(self) -> Result<(), BusError> {
        let mut sub = self.bus.psubscribe(CONN_PATTERN).await?;
        info!(pattern = CONN_PATTERN, "worker subscribed");

        while let Some(msg) = sub.next().await {
            let worker = self.clone();
            self.tasks.spawn(async move { worker.process(msg).await });
        }

        warn!("conn.* subscription ended; stopping worker");
        self.tasks.shutdown().await;
        Ok(())
    }

    #[instrument(name = "process", skip(self, msg), fields(topic = %msg.topic))]
    async fn process(&self, msg: BusMessage) {
        let Some(id) = msg.topic.strip_prefix("conn.") else {
            warn!("message outside the conn.* namespace; ignoring");
            return;
        };

        match msg.payload.as_ref() {
            SENTINEL_INIT => self.start_watch(id).await,
            SENTINEL_CLOSED => {
                if self.registry.unregister(id) {
                    debug!(id, "watcher stopped");
                }
            }
            payload => self.handle_request(id, payload).await,
        }
    }

    /// Start the keyspace watcher for a connection. The watcher pushes one
    /// snapshot immediately, so a latently connected client gets data
    /// without having sent anything.
    async fn start_watch(&self, id: &str) {
        let sub = match self.bus.psubscribe(KEYSPACE_PATTERN).await {
            Ok(sub) => sub,
            Err(err) => {
                error!(%err, id, "keyspace subscribe failed; no pushes for this connection");
                return;
            }
        };

        if self.registry.lookup(id).is_some() {
            debug!(id, "replacing existing watcher");
        }
        let watch_tasks = self.tasks.child();
        self.registry.register(id, watch_tasks.clone());

        let worker = self.clone();
        let id = id.to_owned();
        watch_tasks.spawn(async move { worker.watch_keys(id, sub).await });
    }

    /// Publish a full snapshot to `worker.<id>` now, and again on every
    /// matching key event, until the subscription ends or the watcher is
    /// cancelled.
    async fn watch_keys(&self, id: String, mut sub: B::Subscription) {
        debug!(%id, pattern = KEYSPACE_PATTERN, "watching key changes");
        self.push_snapshot(&id).await;
        while let Some(_event) = sub.next().await {
            self.push_snapshot(&id).await;
        }
        debug!(%id, "keyspace watcher ended");
    }

    async fn handle_request(&self, id: &str, payload: &[u8]) {
        let request = match decode(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, id, "discarding undecodable payload");
                return;
            }
        };

        match request {
            ClientRequest::SetFavoriteNumber(cmd) => {
                debug!(user = %cmd.user_name, favorite_number = cmd.favorite_number, "set");
                let mut conn = self.store.clone();
                if let Err(err) = store::set_favorite(&mut conn, &cmd).await {
                    error!(%err, "store update failed");
                }
                // Snapshot fanout to every connection happens through the
                // keyspace watchers; nothing to publish here.
            }
            ClientRequest::ListAllUsers(_) => self.push_snapshot(id).await,
        }
    }

    /// Read the sorted user snapshot and publish it to the connection's
    /// outbound topic, best-effort.
    async fn push_snapshot(&self, id: &str) {
        let mut conn = self.store.clone();
        let users = match store::all_users(&mut conn).await {
            Ok(users) => users,
            Err(err) => {
                error!(%err, "snapshot read failed");
                return;
            }
        };
        let reply = match UserListReply::new(users).to_bytes() {
            Ok(reply) => reply,
            Err(err) => {
                error!(%err, "snapshot serialization failed");
                return;
            }
        };
        if let Err(err) = self.bus.publish(&topics::outbound(id), reply).await {
            error!(%err, id, "snapshot publish failed; message dropped");
        }
    }
}
