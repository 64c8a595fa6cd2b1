//! Websocket entry point for the gateway, built on [`axum`]'s websocket
//! support.
//!
//! [`GatewayCfg`] is the [`State`] for the [`gateway_ws`] handler. It wraps
//! the [`ConnectionManager`], which assigns connection ids and starts the
//! per-connection tasks; see the [`crate::conn`] module for what those tasks
//! do. Route the handler with [`axum::routing::get`] (or use [`router`]) so
//! that non-GET requests are rejected with a 405; non-upgrade GET requests
//! are rejected by the [`WebSocketUpgrade`] extractor itself.

use crate::{
    bus::{topics, Bus},
    conn::{self, ConnectionHandle, Timings, DEFAULT_OUTBOUND_BUFFER_PER_CONNECTION, MAX_FRAME_SIZE},
    tasks::TaskSet,
};
use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    http::HeaderMap,
    response::Response,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::runtime::Handle;
use tracing::{debug, debug_span, warn, Instrument};

/// Assigns ids to new connections and starts their tasks.
pub(crate) struct ConnectionManager<B: Bus> {
    pub(crate) root_tasks: TaskSet,
    pub(crate) next_id: AtomicU64,
    pub(crate) bus: B,
    pub(crate) timings: Timings,
    pub(crate) outbound_buffer_per_connection: usize,
}

impl<B: Bus> ConnectionManager<B> {
    fn new(bus: B) -> Self {
        Self {
            root_tasks: TaskSet::default(),
            next_id: AtomicU64::new(0),
            bus,
            timings: Timings::default(),
            outbound_buffer_per_connection: DEFAULT_OUTBOUND_BUFFER_PER_CONNECTION,
        }
    }

    /// Increment the connection id counter and return an unused id.
    fn next_id(&self) -> conn::ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Handle a freshly upgraded socket: assign an id, establish the
    /// connection's bus subscription, and start its tasks.
    pub(crate) async fn handle_new_connection(&self, socket: WebSocket) -> ConnectionHandle {
        let conn_id = self.next_id();

        let subscription = match self.bus.subscribe(&topics::outbound(conn_id)).await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                // The client-to-bus direction still works without it.
                warn!(%err, conn_id, "bus subscription failed; no backend-to-client delivery");
                None
            }
        };

        conn::start(
            conn_id,
            socket,
            self.bus.clone(),
            subscription,
            self.timings,
            self.outbound_buffer_per_connection,
            self.root_tasks.child(),
        )
    }
}

/// Configuration and shared state for the websocket gateway.
///
/// Created from a [`Bus`] and passed to [`gateway_ws`] as axum [`State`].
/// The builder methods configure the runtime handle tasks are spawned on,
/// the per-connection timing profile, and the per-connection outbound
/// buffer size.
///
/// # Example
///
/// ```no_run
/// # use sockbus::{GatewayCfg, bus::MemoryBus};
/// # fn _main(handle: tokio::runtime::Handle) {
/// let cfg = GatewayCfg::new(MemoryBus::new())
///     .with_handle(handle)
///     .with_outbound_buffer(32);
/// # }
/// ```
#[derive(Clone)]
pub struct GatewayCfg<B: Bus> {
    pub(crate) inner: Arc<ConnectionManager<B>>,
}

impl<B: Bus> core::fmt::Debug for GatewayCfg<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GatewayCfg")
            .field("next_id", &self.inner.next_id)
            .field("timings", &self.inner.timings)
            .field(
                "outbound_buffer_per_connection",
                &self.inner.outbound_buffer_per_connection,
            )
            .finish_non_exhaustive()
    }
}

impl<B: Bus> GatewayCfg<B> {
    /// Create a new [`GatewayCfg`] over the given bus, with default timings.
    pub fn new(bus: B) -> Self {
        Self {
            inner: Arc::new(ConnectionManager::new(bus)),
        }
    }

    fn into_inner(self) -> ConnectionManager<B> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(arc) => ConnectionManager {
                root_tasks: arc.root_tasks.clone(),
                next_id: AtomicU64::new(arc.next_id.load(Ordering::Relaxed)),
                bus: arc.bus.clone(),
                timings: arc.timings,
                outbound_buffer_per_connection: arc.outbound_buffer_per_connection,
            },
        }
    }

    /// Set the runtime handle on which connection tasks are spawned. When
    /// unset, tasks run on the current runtime.
    pub fn with_handle(self, handle: Handle) -> Self {
        let mut inner = self.into_inner();
        inner.root_tasks = TaskSet::with_handle(handle);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Set the timing profile applied to each connection.
    pub fn with_timings(self, timings: Timings) -> Self {
        let mut inner = self.into_inner();
        inner.timings = timings;
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Set the outbound buffer size per connection. This bounds how many
    /// backend messages may be queued for a client that is not reading.
    pub fn with_outbound_buffer(self, buffer: usize) -> Self {
        let mut inner = self.into_inner();
        inner.outbound_buffer_per_connection = buffer;
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Cancel every connection started through this gateway and wait for
    /// all of their tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.root_tasks.shutdown().await;
    }
}

/// Axum handler for gateway websocket connections.
///
/// Enforces the inbound frame-size ceiling on the upgraded socket and logs
/// the reverse-proxy client address (`X-Forwarded-For`) when present. The
/// connection's tasks are started before the upgrade future resolves.
pub async fn gateway_ws<B: Bus>(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(cfg): State<GatewayCfg<B>>,
) -> Response {
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_owned();

    ws.max_message_size(MAX_FRAME_SIZE).on_upgrade(move |socket| {
        let span = debug_span!("ws connection", client_ip = %client_ip);
        async move {
            let handle = cfg.inner.handle_new_connection(socket).await;
            debug!(conn_id = handle.id(), "connection started");
        }
        .instrument(span)
    })
}

/// Build an [`axum::Router`] exposing the gateway at `/ws`.
pub fn router<B: Bus>(cfg: GatewayCfg<B>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(gateway_ws::<B>))
        .with_state(cfg)
}
