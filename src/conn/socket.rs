use super::ConnectionId;
use crate::{error::SocketError, tasks::TaskSet};
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tracing::{debug, instrument, warn};

/// Control requests the controller sends to the [`WriteTask`], multiplexed
/// alongside the outbound frame queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketControl {
    /// Write a keepalive ping to the peer.
    Ping,
    /// Write a close frame, notifying the peer of shutdown.
    Close,
}

/// Pumps frames from the websocket to the controller.
///
/// Runs until the socket yields a fatal read error, the peer goes away, or
/// the liveness deadline passes with no traffic at all. The error is
/// reported once and the task stops; it never restarts.
pub(crate) struct ReadTask {
    pub(crate) conn_id: ConnectionId,
    pub(crate) stream: SplitStream<WebSocket>,
    /// Inbound frames, consumed by the controller. Blocking on a full queue
    /// is fine: the controller always drains it.
    pub(crate) frames: mpsc::Sender<Bytes>,
    pub(crate) errors: oneshot::Sender<SocketError>,
    pub(crate) pong_wait: Duration,
}

impl ReadTask {
    #[instrument(name = "ReadTask", skip(self), fields(conn_id = self.conn_id))]
    async fn task_future(self) {
        let ReadTask {
            mut stream,
            frames,
            errors,
            pong_wait,
            ..
        } = self;

        let err = loop {
            // Any traffic from the peer, pongs included, extends the
            // liveness window.
            let msg = match timeout(pong_wait, stream.next()).await {
                Err(_) => break SocketError::ReadTimeout,
                Ok(None) => break SocketError::Closed,
                Ok(Some(Err(err))) => break SocketError::Transport(err),
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Binary(payload) => {
                    if frames.send(payload).await.is_err() {
                        // Controller is gone; nothing left to report to.
                        return;
                    }
                }
                Message::Close(frame) => {
                    debug!(?frame, "peer sent close frame");
                    break SocketError::Closed;
                }
                Message::Text(_) => {
                    warn!("ignoring text frame on binary-only socket");
                }
                // Pings are answered by the websocket layer itself.
                Message::Ping(_) | Message::Pong(_) => {}
            }
        };

        debug!(%err, "socket read ended");
        let _ = errors.send(err);
    }

    pub(crate) fn spawn(self, tasks: &TaskSet) {
        tasks.spawn(self.task_future());
    }
}

/// Pumps frames and keepalive pings from the controller to the websocket.
///
/// Performs exactly one write at a time, each under `write_wait`. A deadline
/// violation counts as a write error. The first write error is reported once
/// and the task stops. Closure of the frame queue (the controller's signal
/// after a read error) is a clean exit.
pub(crate) struct WriteTask {
    pub(crate) conn_id: ConnectionId,
    pub(crate) sink: SplitSink<WebSocket, Message>,
    pub(crate) frames: mpsc::Receiver<Bytes>,
    pub(crate) control: mpsc::Receiver<SocketControl>,
    pub(crate) errors: oneshot::Sender<SocketError>,
    pub(crate) write_wait: Duration,
}

impl WriteTask {
    #[instrument(name = "WriteTask", skip(self), fields(conn_id = self.conn_id))]
    async fn task_future(self) {
        let WriteTask {
            mut sink,
            mut frames,
            mut control,
            errors,
            write_wait,
            ..
        } = self;

        let result = loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    None => {
                        debug!("outbound queue closed");
                        break Ok(());
                    }
                    Some(payload) => {
                        if let Err(err) =
                            write(&mut sink, Message::Binary(payload), write_wait).await
                        {
                            break Err(err);
                        }
                    }
                },
                ctl = control.recv() => match ctl {
                    None => break Ok(()),
                    Some(SocketControl::Ping) => {
                        if let Err(err) =
                            write(&mut sink, Message::Ping(Bytes::new()), write_wait).await
                        {
                            break Err(err);
                        }
                    }
                    Some(SocketControl::Close) => {
                        let close = Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: Utf8Bytes::from_static("server closed connection"),
                        }));
                        if let Err(err) = write(&mut sink, close, write_wait).await {
                            break Err(err);
                        }
                        // Stay alive to be cancelled with the rest of the
                        // connection; the controller stops sending frames
                        // once it has asked for the close handshake.
                    }
                },
            }
        };

        if let Err(err) = result {
            warn!(%err, "socket write failed");
            let _ = errors.send(err);
        }
    }

    pub(crate) fn spawn(self, tasks: &TaskSet) {
        tasks.spawn(self.task_future());
    }
}

async fn write(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    deadline: Duration,
) -> Result<(), SocketError> {
    match timeout(deadline, sink.send(msg)).await {
        Err(_) => Err(SocketError::WriteTimeout),
        Ok(Err(err)) => Err(SocketError::Transport(err)),
        Ok(Ok(())) => Ok(()),
    }
}
