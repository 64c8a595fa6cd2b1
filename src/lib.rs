//! sockbus: a websocket gateway onto a shared publish/subscribe bus.
//!
//! The gateway accepts long-lived, bidirectional client connections and
//! bridges each one to a pair of per-connection bus topics, so any number
//! of backend workers can process client traffic without ever holding a
//! socket reference:
//!
//! ```text
//! client frame -> reader -> controller -> publish conn.<id>  -> worker
//! worker       -> publish worker.<id>   -> controller -> writer -> client
//! ```
//!
//! Each connection runs four tasks: socket reader, socket writer, bus
//! listener, and the controller that owns all cross-task coordination
//! (delivery, keepalive pings, error propagation, shutdown). Whichever side
//! fails first, every task of that connection terminates deterministically
//! after a short grace period; no connection's failure can affect another.
//! See the [`conn`] module docs for the details.
//!
//! ## Serving the gateway
//!
//! ```no_run
//! use sockbus::{bus::RedisBus, router, GatewayCfg};
//!
//! # async fn _main() -> eyre::Result<()> {
//! let bus = RedisBus::connect("redis://127.0.0.1:6379").await?;
//! let app = router(GatewayCfg::new(bus));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8888").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The [`bus::Bus`] trait is the transport seam: [`bus::RedisBus`] is the
//! production adapter, [`bus::MemoryBus`] runs everything in-process. The
//! [`worker`] module implements the demo backend (user favorite numbers)
//! that consumes the other side of the topic pair.

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    clippy::missing_const_for_fn,
    rustdoc::all
)]
#![deny(unused_must_use, rust_2018_idioms)]

pub mod bus;

pub mod config;

mod conn;
pub use conn::{
    ConnectionHandle, ConnectionId, Timings, DEFAULT_OUTBOUND_BUFFER_PER_CONNECTION,
    MAX_FRAME_SIZE,
};

mod error;
pub use error::{BusError, SocketError};

mod gateway;
pub use gateway::{gateway_ws, router, GatewayCfg};

mod tasks;

pub mod worker;
