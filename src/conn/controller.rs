use super::{ConnectionId, SocketControl, Timings};
use crate::{
    bus::{topics, Bus, BusStream, SENTINEL_CLOSED, SENTINEL_INIT},
    error::SocketError,
    tasks::TaskSet,
};
use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_stream::StreamExt;
use tracing::{debug, error, instrument, trace, warn};

/// Owns the connection's `worker.<id>` subscription and feeds each message
/// to the controller. Exits when the subscription ends (terminal: transport
/// closed or unsubscribed) or the controller goes away.
pub(crate) struct BusListenTask<S> {
    pub(crate) conn_id: ConnectionId,
    pub(crate) subscription: S,
    pub(crate) forward: mpsc::Sender<Bytes>,
}

impl<S: BusStream> BusListenTask<S> {
    #[instrument(name = "BusListenTask", skip(self), fields(conn_id = self.conn_id))]
    async fn task_future(self) {
        let BusListenTask {
            mut subscription,
            forward,
            ..
        } = self;

        while let Some(msg) = subscription.next().await {
            trace!(topic = %msg.topic, len = msg.payload.len(), "bus message for client");
            if forward.send(msg.payload).await.is_err() {
                debug!("controller gone");
                return;
            }
        }
        debug!("bus subscription ended");
    }

    pub(crate) fn spawn(self, tasks: &TaskSet) {
        tasks.spawn(self.task_future());
    }
}

/// The per-connection state machine: Active until the first terminal
/// condition, Closing for one grace period, then gone.
///
/// All cross-task signals converge on this single event loop, so the
/// `closed` flag needs no lock and there is exactly one shutdown path no
/// matter which side failed first.
pub(crate) struct ControlTask<B: Bus> {
    pub(crate) conn_id: ConnectionId,
    pub(crate) bus: B,
    pub(crate) timings: Timings,
    /// Frames read from the client socket.
    pub(crate) from_socket: mpsc::Receiver<Bytes>,
    /// Messages from the connection's bus subscription.
    pub(crate) from_bus: mpsc::Receiver<Bytes>,
    /// Explicit close requests from [`super::ConnectionHandle`]s.
    pub(crate) close_requests: mpsc::Receiver<()>,
    pub(crate) read_errors: oneshot::Receiver<SocketError>,
    pub(crate) write_errors: oneshot::Receiver<SocketError>,
    /// Outbound frames to the writer. Dropped to close the writer's queue
    /// after a read error.
    pub(crate) to_socket: Option<mpsc::Sender<Bytes>>,
    /// Ping and close-frame requests to the writer.
    pub(crate) control: mpsc::Sender<SocketControl>,
    /// The connection's task set; cancelled exactly once, at termination.
    pub(crate) tasks: TaskSet,
}

impl<B: Bus> ControlTask<B> {
    #[instrument(name = "ControlTask", skip(self), fields(conn_id = self.conn_id))]
    async fn task_future(self) {
        let ControlTask {
            conn_id,
            bus,
            timings,
            mut from_socket,
            mut from_bus,
            mut close_requests,
            mut read_errors,
            mut write_errors,
            mut to_socket,
            control,
            tasks,
        } = self;

        let inbound_topic = topics::inbound(conn_id);

        // Workers key on this sentinel to set up per-connection state, so it
        // must precede any client frame on the inbound topic.
        publish(&bus, &inbound_topic, Bytes::from_static(SENTINEL_INIT)).await;

        let mut ping = time::interval_at(
            Instant::now() + timings.ping_period(),
            timings.ping_period(),
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let grace = time::sleep(std::time::Duration::ZERO);
        tokio::pin!(grace);

        // Mutated only here, in this single-threaded loop.
        let mut closed = false;

        // recv() on a channel whose senders are gone resolves immediately,
        // so each input is masked out of the select once it is exhausted.
        let mut socket_gone = false;
        let mut bus_gone = false;
        let mut handles_gone = false;
        let mut read_reported = false;
        let mut write_reported = false;

        loop {
            tokio::select! {
                _ = &mut grace, if closed => break,

                frame = from_socket.recv(), if !socket_gone => match frame {
                    Some(payload) if !closed => {
                        publish(&bus, &inbound_topic, payload).await;
                    }
                    // Draining while Closing; the frame goes nowhere.
                    Some(_) => {}
                    None => socket_gone = true,
                },

                msg = from_bus.recv(), if !bus_gone => match msg {
                    Some(payload) if !closed => {
                        if let Some(tx) = &to_socket {
                            if tx.send(payload).await.is_err() {
                                debug!("writer gone; dropping outbound message");
                            }
                        }
                    }
                    // Late bus messages during Closing are discarded.
                    Some(_) => trace!("discarding bus message while closing"),
                    None => bus_gone = true,
                },

                req = close_requests.recv(), if !handles_gone => match req {
                    Some(()) if !closed => {
                        debug!("explicit close requested");
                        send_close_frame(&control);
                        closed = true;
                        grace.as_mut().reset(Instant::now() + timings.grace);
                    }
                    Some(()) => {}
                    None => handles_gone = true,
                },

                _ = ping.tick(), if !closed => {
                    // try_send: a skipped ping is made up by the next tick,
                    // and a dead writer surfaces via the write-error path.
                    let _ = control.try_send(SocketControl::Ping);
                }

                res = &mut write_errors, if !write_reported => {
                    write_reported = true;
                    if let Ok(err) = res {
                        if !closed {
                            warn!(%err, "write failed; closing connection");
                            send_close_frame(&control);
                            closed = true;
                            grace.as_mut().reset(Instant::now() + timings.grace);
                        }
                    }
                },

                res = &mut read_errors, if !read_reported => {
                    read_reported = true;
                    if let Ok(err) = res {
                        if !closed {
                            debug!(%err, "read ended; closing connection");
                            // Closing the outbound queue lets the writer
                            // return cleanly.
                            to_socket = None;
                            closed = true;
                            grace.as_mut().reset(Instant::now() + timings.grace);
                        }
                    }
                },
            }
        }

        // Terminated: tell the backend, then stop every sibling task.
        // Cancelling the set drops the bus listener, which releases the
        // subscription, and drops both socket halves, which closes the
        // transport.
        publish(&bus, &inbound_topic, Bytes::from_static(SENTINEL_CLOSED)).await;
        debug!("connection terminated");
        tasks.cancel();
    }

    pub(crate) fn spawn(self) -> JoinHandle<Option<()>> {
        let tasks = self.tasks.clone();
        tasks.spawn(self.task_future())
    }
}

/// Best-effort publish: failures are logged and the message is dropped, per
/// the bus contract. The connection keeps running.
async fn publish<B: Bus>(bus: &B, topic: &str, payload: Bytes) {
    if let Err(err) = bus.publish(topic, payload).await {
        error!(%err, topic, "bus publish failed; message dropped");
    }
}

/// Queue a close frame for the writer, notifying the peer of shutdown. If
/// the writer is already gone or saturated the handshake is skipped; the
/// socket is torn down at termination regardless.
fn send_close_frame(control: &mpsc::Sender<SocketControl>) {
    if control.try_send(SocketControl::Close).is_err() {
        debug!("close frame not queued; writer unavailable");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bus::{Bus, MemoryBus},
        conn::ConnectionHandle,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    const CONN_ID: ConnectionId = 7;

    fn timings() -> Timings {
        Timings {
            grace: Duration::from_millis(200),
            write_wait: Duration::from_secs(5),
            pong_wait: Duration::from_secs(60),
        }
    }

    /// Channel ends a test drives a [`ControlTask`] with, standing in for
    /// the reader, writer, bus listener, and handle holders.
    struct Harness {
        handle: ConnectionHandle,
        from_socket: mpsc::Sender<Bytes>,
        from_bus: mpsc::Sender<Bytes>,
        read_errors: oneshot::Sender<SocketError>,
        write_errors: oneshot::Sender<SocketError>,
        to_socket: mpsc::Receiver<Bytes>,
        control: mpsc::Receiver<SocketControl>,
        tasks: TaskSet,
        controller: JoinHandle<Option<()>>,
    }

    fn start(bus: MemoryBus) -> Harness {
        let (from_socket_tx, from_socket_rx) = mpsc::channel(1);
        let (from_bus_tx, from_bus_rx) = mpsc::channel(16);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (read_err_tx, read_err_rx) = oneshot::channel();
        let (write_err_tx, write_err_rx) = oneshot::channel();
        let (to_socket_tx, to_socket_rx) = mpsc::channel(16);
        let (control_tx, control_rx) = mpsc::channel(4);
        let tasks = TaskSet::default();

        let controller = ControlTask {
            conn_id: CONN_ID,
            bus,
            timings: timings(),
            from_socket: from_socket_rx,
            from_bus: from_bus_rx,
            close_requests: close_rx,
            read_errors: read_err_rx,
            write_errors: write_err_rx,
            to_socket: Some(to_socket_tx),
            control: control_tx,
            tasks: tasks.clone(),
        }
        .spawn();

        Harness {
            handle: ConnectionHandle {
                id: CONN_ID,
                close: close_tx,
            },
            from_socket: from_socket_tx,
            from_bus: from_bus_tx,
            read_errors: read_err_tx,
            write_errors: write_err_tx,
            to_socket: to_socket_rx,
            control: control_rx,
            tasks,
            controller,
        }
    }

    async fn expect_sentinel(sub: &mut <MemoryBus as Bus>::Subscription, sentinel: &[u8]) {
        let msg = timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("timed out waiting for sentinel")
            .expect("bus subscription ended");
        assert_eq!(msg.payload.as_ref(), sentinel);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_reach_the_bus_in_order() {
        let bus = MemoryBus::new();
        let mut sub = bus.psubscribe("conn.*").await.unwrap();
        let h = start(bus);

        expect_sentinel(&mut sub, SENTINEL_INIT).await;
        for payload in [&b"a"[..], b"b", b"c"] {
            h.from_socket.send(Bytes::from_static(payload)).await.unwrap();
        }
        for payload in [&b"a"[..], b"b", b"c"] {
            let msg = sub.next().await.unwrap();
            assert_eq!(msg.topic, "conn.7");
            assert_eq!(msg.payload.as_ref(), payload);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bus_messages_reach_the_writer() {
        let bus = MemoryBus::new();
        let mut h = start(bus);

        h.from_bus.send(Bytes::from_static(b"hello")).await.unwrap();
        let frame = h.to_socket.recv().await.unwrap();
        assert_eq!(frame.as_ref(), b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_runs_the_shutdown_protocol() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("conn.7").await.unwrap();
        let mut h = start(bus);

        expect_sentinel(&mut sub, SENTINEL_INIT).await;
        h.handle.close().await;

        // Close handshake is queued for the writer, once.
        assert_eq!(h.control.recv().await, Some(SocketControl::Close));

        // A second terminal condition while Closing is a no-op.
        h.write_errors.send(SocketError::WriteTimeout).unwrap();

        expect_sentinel(&mut sub, SENTINEL_CLOSED).await;
        timeout(Duration::from_secs(5), h.controller)
            .await
            .expect("controller did not terminate")
            .unwrap();

        // No second close frame was queued for the writer.
        assert_eq!(h.control.try_recv().ok(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_closes_the_outbound_queue() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("conn.7").await.unwrap();
        let mut h = start(bus);

        expect_sentinel(&mut sub, SENTINEL_INIT).await;
        h.read_errors.send(SocketError::Closed).unwrap();

        // The writer's queue closes so it can return cleanly.
        assert_eq!(h.to_socket.recv().await, None);

        expect_sentinel(&mut sub, SENTINEL_CLOSED).await;
        timeout(Duration::from_secs(5), h.controller)
            .await
            .expect("controller did not terminate")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closing_is_deaf_to_bus_messages() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("conn.7").await.unwrap();
        let mut h = start(bus);

        expect_sentinel(&mut sub, SENTINEL_INIT).await;
        h.write_errors.send(SocketError::WriteTimeout).unwrap();
        assert_eq!(h.control.recv().await, Some(SocketControl::Close));

        // Arrives while Closing: discarded, never forwarded, no deadlock.
        h.from_bus.send(Bytes::from_static(b"late")).await.unwrap();
        assert!(
            timeout(Duration::from_millis(50), h.to_socket.recv())
                .await
                .is_err(),
            "no frame may be forwarded once Closing has begun"
        );

        // Client frames arriving while Closing are drained, not published.
        h.from_socket.send(Bytes::from_static(b"x")).await.unwrap();

        expect_sentinel(&mut sub, SENTINEL_CLOSED).await;
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_are_requested() {
        let bus = MemoryBus::new();
        let mut h = start(bus);

        // ping period is pong_wait * 7 / 10 = 42s with the test timings
        assert_eq!(h.control.recv().await, Some(SocketControl::Ping));
        assert_eq!(h.control.recv().await, Some(SocketControl::Ping));
    }

    #[tokio::test(start_paused = true)]
    async fn termination_cancels_the_task_set() {
        let bus = MemoryBus::new();
        let h = start(bus);

        let sibling = h.tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        h.read_errors.send(SocketError::Closed).unwrap();
        timeout(Duration::from_secs(5), h.controller)
            .await
            .expect("controller did not terminate")
            .unwrap();
        assert_eq!(
            timeout(Duration::from_secs(5), sibling)
                .await
                .expect("sibling task leaked")
                .unwrap(),
            None
        );
    }
}
