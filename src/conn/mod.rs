//! Per-connection concurrency management.
//!
//! Every accepted websocket runs four independent tasks that communicate
//! only through channels:
//!
//! - [`ReadTask`] pulls frames off the socket and hands them to the
//!   controller.
//! - [`WriteTask`] performs every socket write (frames, keepalive pings, the
//!   close handshake), one at a time, under a per-write deadline.
//! - `BusListenTask` owns the connection's `worker.<id>` subscription and
//!   feeds backend messages to the controller.
//! - [`ControlTask`] is the state machine that owns all cross-task
//!   coordination: it publishes client frames to `conn.<id>`, forwards bus
//!   messages to the writer, drives the keepalive timer, and executes the
//!   shutdown protocol.
//!
//! Whichever side fails first, the controller funnels it into a single
//! Closing transition, waits out a short grace period so concurrent
//! producers can finish their in-flight sends, then cancels the whole task
//! set. No task outlives the controller.

mod controller;
mod socket;

pub(crate) use controller::{BusListenTask, ControlTask};
pub(crate) use socket::{ReadTask, SocketControl, WriteTask};

use crate::{bus::Bus, tasks::TaskSet};
use axum::extract::ws::WebSocket;
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Identifies one connection for the lifetime of the process. Never reused
/// while any task of the connection is alive.
pub type ConnectionId = u64;

/// Maximum inbound frame size allowed from a peer, in bytes. Larger frames
/// are a fatal read error for that connection.
pub const MAX_FRAME_SIZE: usize = 1024 * 15;

/// Default buffer size for the outbound-to-socket and bus-to-controller
/// queues, per connection.
pub const DEFAULT_OUTBOUND_BUFFER_PER_CONNECTION: usize = 16;

/// Timing profile for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Delay between entering Closing and releasing all resources, so that
    /// concurrent producers mid-send are drained rather than stranded.
    pub grace: Duration,
    /// Deadline applied to each individual socket write.
    pub write_wait: Duration,
    /// How long the peer may stay silent (no frames, no pongs) before the
    /// connection is considered dead.
    pub pong_wait: Duration,
}

impl Timings {
    /// Keepalive ping period: under the liveness window, so a healthy peer
    /// always gets a chance to answer before the deadline.
    pub const fn ping_period(&self) -> Duration {
        Duration::from_millis(self.pong_wait.as_millis() as u64 * 7 / 10)
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            write_wait: Duration::from_secs(50),
            pong_wait: Duration::from_secs(600),
        }
    }
}

/// Handle for requesting an explicit close of a running connection.
///
/// Dropping the handle does not affect the connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub(crate) id: ConnectionId,
    pub(crate) close: mpsc::Sender<()>,
}

impl ConnectionHandle {
    /// The connection's id.
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Ask the controller to close the connection: the peer is sent a close
    /// frame and the connection terminates after its grace period. A no-op
    /// if the connection is already closing or gone.
    pub async fn close(&self) {
        let _ = self.close.send(()).await;
    }
}

/// Wire up and start the four tasks for an accepted socket.
///
/// `subscription` is the connection's `worker.<id>` stream; `None` means the
/// subscription could not be established and the connection runs without
/// backend-to-client delivery.
pub(crate) fn start<B: Bus>(
    conn_id: ConnectionId,
    socket: WebSocket,
    bus: B,
    subscription: Option<B::Subscription>,
    timings: Timings,
    buffer: usize,
    tasks: TaskSet,
) -> ConnectionHandle {
    let (sink, stream) = socket.split();

    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(1);
    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(buffer);
    let (control_tx, control_rx) = mpsc::channel::<SocketControl>(4);
    let (from_bus_tx, from_bus_rx) = mpsc::channel::<Bytes>(buffer);
    let (close_tx, close_rx) = mpsc::channel::<()>(1);
    let (read_err_tx, read_err_rx) = oneshot::channel();
    let (write_err_tx, write_err_rx) = oneshot::channel();

    ReadTask {
        conn_id,
        stream,
        frames: inbound_tx,
        errors: read_err_tx,
        pong_wait: timings.pong_wait,
    }
    .spawn(&tasks);

    WriteTask {
        conn_id,
        sink,
        frames: outbound_rx,
        control: control_rx,
        errors: write_err_tx,
        write_wait: timings.write_wait,
    }
    .spawn(&tasks);

    if let Some(subscription) = subscription {
        BusListenTask {
            conn_id,
            subscription,
            forward: from_bus_tx,
        }
        .spawn(&tasks);
    }

    ControlTask {
        conn_id,
        bus,
        timings,
        from_socket: inbound_rx,
        from_bus: from_bus_rx,
        close_requests: close_rx,
        read_errors: read_err_rx,
        write_errors: write_err_rx,
        to_socket: Some(outbound_tx),
        control: control_tx,
        tasks,
    }
    .spawn();

    ConnectionHandle {
        id: conn_id,
        close: close_tx,
    }
}
