use futures_util::{SinkExt, Stream, StreamExt};
use sockbus::{bus::BusMessage, bus::MemoryBus, router, GatewayCfg, Timings};
use std::{net::SocketAddr, time::Duration};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

/// Short grace period so shutdown scenarios finish quickly; the liveness
/// window stays long enough that keepalive never interferes with a test.
pub const TEST_TIMINGS: Timings = Timings {
    grace: Duration::from_millis(200),
    write_wait: Duration::from_secs(5),
    pong_wait: Duration::from_secs(600),
};

/// Serve a gateway over a [`MemoryBus`] on an ephemeral port.
pub async fn serve_gateway() -> (SocketAddr, MemoryBus, GatewayCfg<MemoryBus>) {
    let bus = MemoryBus::new();
    let cfg = GatewayCfg::new(bus.clone()).with_timings(TEST_TIMINGS);
    let app = router(cfg.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    (addr, bus, cfg)
}

/// A binary-frame websocket client for exercising the gateway.
pub struct WsClient {
    socket: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

pub async fn ws_client(addr: SocketAddr) -> WsClient {
    let request = format!("ws://{addr}/ws").into_client_request().unwrap();
    let (socket, _) = connect_async(request).await.unwrap();
    WsClient { socket }
}

impl WsClient {
    pub async fn send(&mut self, payload: &[u8]) {
        self.socket
            .send(Message::Binary(payload.to_vec().into()))
            .await
            .unwrap();
    }

    /// Receive the next binary frame, skipping protocol-level messages.
    pub async fn recv(&mut self) -> Vec<u8> {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection ended")
                .unwrap()
            {
                Message::Binary(payload) => return payload.to_vec(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected message type: {other:?}"),
            }
        }
    }

    pub async fn close(mut self) {
        self.socket.close(None).await.unwrap();
    }
}

/// Await the next message on a bus subscription, with a timeout.
pub async fn next_msg<S>(sub: &mut S) -> BusMessage
where
    S: Stream<Item = BusMessage> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("timed out waiting for a bus message")
        .expect("bus subscription ended")
}

/// Poll until `predicate` holds, panicking after a few seconds.
pub async fn wait_for(mut predicate: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
