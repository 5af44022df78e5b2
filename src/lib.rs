//! Asynchronous transport connections with shared instrumentation.
//!
//! This library wraps TCP, UDP, and WebSocket endpoints behind one
//! [`Connection`] contract so higher layers can manage heterogeneous peers
//! uniformly. Every connection carries the same bookkeeping: a process-unique
//! id, atomic byte and packet counters, per-call read/write deadlines, an
//! optional compression filter, and a last-active timestamp for idle reaping.
//!
//! A [`Session`] pairs one connection with an ordered registry of close
//! hooks and guarantees the hooks run exactly once, after the transport is
//! torn down.
//!
//! # Transport variants
//!
//! - [`StreamConnection`]: TCP byte stream. Accepts single and scatter
//!   buffers; scatter writes use vectored I/O and bypass compression.
//! - [`DatagramConnection`]: UDP packets. Sends take a [`DatagramContext`]
//!   whose destination is mandatory for listener-role endpoints.
//! - [`FramedConnection`]: WebSocket messages. One send is one binary frame;
//!   pings are answered inline and reads never time out.
//!
//! # Example
//!
//! ```rust,no_run
//! use async_conn::prelude::*;
//! use std::time::Duration;
//!
//! # async fn run() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let tcp = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//! let conn = StreamConnection::new(tcp);
//! conn.set_read_timeout(Duration::from_secs(3))?;
//! conn.set_compress_type(CompressType::Snappy)?;
//!
//! let session = Session::new(conn, EndpointRole::Connected);
//! session.add_close_callback("metrics", 1, || println!("gone"));
//! session.send(b"hello".to_vec()).await?;
//! session.close(None).await;
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod conn;
pub mod error;
pub mod prelude;
pub mod session;
pub mod util;

pub use callback::{CallbackRegistry, CloseHook, HookFailure, HookKey};
pub use conn::{
    CompressType, ConnCore, Connection, DatagramConnection, DatagramContext, FramedConnection,
    Payload, StreamConnection,
};
pub use error::{ConfigErrorKind, Direction, Error, Result};
pub use session::{EndpointRole, Session, SessionRef};
pub use util::bind_udp_socket;
