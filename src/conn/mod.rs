//! Transport connection abstraction.
//!
//! Provides the [`Connection`] trait and three implementations with different
//! transfer semantics: [`StreamConnection`] (TCP byte stream),
//! [`DatagramConnection`] (UDP packets), and [`FramedConnection`] (WebSocket
//! message frames). All variants share the same instrumentation: per-call
//! deadlines, atomic byte/packet counters, optional compression, and a
//! last-active timestamp consumed by idle-session reapers.

mod compress;
mod core;
mod datagram;
mod framed;
mod stream;

pub use compress::CompressType;
pub use core::ConnCore;
pub use datagram::DatagramConnection;
pub use framed::FramedConnection;
pub use stream::StreamConnection;

use crate::error::Result;
use crate::session::SessionRef;
use bytes::Bytes;
use smallvec::SmallVec;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::LazyLock;
use std::sync::Weak;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Process-launch epoch. Last-active timestamps are stored as nanosecond
/// offsets from this instant so they fit in a single atomic word.
static LAUNCH_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Process-wide connection id counter. Wraps at `u32::MAX`; ids stay unique
/// for the first four billion connections of a process, which is the same
/// limit the counters below carry.
static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(0);

pub(crate) fn next_conn_id() -> u32 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// The instant the process-wide epoch was initialized.
///
/// Initialized once, on first use by any connection.
pub fn launch_epoch() -> Instant {
    *LAUNCH_EPOCH
}

/// Convert a stored nanosecond offset back to an absolute instant.
pub fn instant_from_offset(nanos: u64) -> Instant {
    *LAUNCH_EPOCH + Duration::from_nanos(nanos)
}

pub(crate) fn offset_since_launch() -> u64 {
    LAUNCH_EPOCH.elapsed().as_nanos() as u64
}

/// Structured context for a datagram send.
///
/// The destination is mandatory only when the local endpoint acts as a
/// connectionless listener; connected sockets send to their peer when it is
/// absent.
#[derive(Debug, Clone)]
pub struct DatagramContext {
    pub data: Bytes,
    pub peer: Option<SocketAddr>,
}

impl DatagramContext {
    pub fn new(data: impl Into<Bytes>, peer: Option<SocketAddr>) -> Self {
        Self {
            data: data.into(),
            peer,
        }
    }
}

/// Opaque payload handed to [`Connection::send`].
///
/// Each transport variant accepts a subset of shapes; a mismatch yields
/// [`Error::PayloadMismatch`](crate::Error::PayloadMismatch) without touching
/// the wire.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A single opaque buffer. Accepted by stream and framed transports.
    Bytes(Bytes),
    /// A scatter list of buffers, written with vectored I/O. Stream only.
    Vectored(SmallVec<[Bytes; 4]>),
    /// A datagram with an optional explicit destination. Datagram only.
    Datagram(DatagramContext),
}

impl Payload {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::Vectored(_) => "vectored bytes",
            Self::Datagram(_) => "datagram context",
        }
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(s: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(s))
    }
}

impl From<DatagramContext> for Payload {
    fn from(ctx: DatagramContext) -> Self {
        Self::Datagram(ctx)
    }
}

/// Transport-agnostic connection contract.
///
/// Identity, counters, and timeout policy live in a composed [`ConnCore`];
/// the default methods below delegate to it so each variant only implements
/// the transport-specific operations (`send`, `close_conn`,
/// `set_compress_type`).
///
/// # Concurrency
///
/// Stream and datagram connections support one concurrent reader and one
/// concurrent writer without internal locking. The framed variant serializes
/// each direction behind its own lock because the underlying message
/// primitive is not safe for concurrent use.
pub trait Connection: Send + Sync {
    /// Shared identity, stats, and timeout state.
    fn core(&self) -> &ConnCore;

    /// Monotonic process-wide connection id.
    fn id(&self) -> u32 {
        self.core().id()
    }

    /// Local address string captured at construction, never re-queried.
    fn local_addr(&self) -> &str {
        self.core().local_addr()
    }

    /// Peer address string captured at construction, never re-queried.
    fn remote_addr(&self) -> &str {
        self.core().remote_addr()
    }

    /// Rebuild the read/write filter chain for the given compression mode.
    fn set_compress_type(&self, mode: CompressType) -> Result<()>;

    /// Deadline applied to each future read call, if set.
    fn read_timeout(&self) -> Option<Duration> {
        self.core().read_timeout()
    }

    /// Set the read deadline. Rejects zero durations; mirrors the value into
    /// the write deadline when that one is unset.
    fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        self.core().set_read_timeout(timeout)
    }

    /// Deadline applied to each future write call, if set.
    fn write_timeout(&self) -> Option<Duration> {
        self.core().write_timeout()
    }

    /// Set the write deadline. Rejects zero durations; mirrors the value into
    /// the read deadline when that one is unset.
    fn set_write_timeout(&self, timeout: Duration) -> Result<()> {
        self.core().set_write_timeout(timeout)
    }

    /// Total payload bytes received, pre-compression sizes.
    fn read_bytes(&self) -> u64 {
        self.core().read_bytes()
    }

    /// Total payload bytes sent, pre-compression sizes.
    fn write_bytes(&self) -> u64 {
        self.core().write_bytes()
    }

    /// Number of packets received.
    fn read_pkg_num(&self) -> u64 {
        self.core().read_pkg_num()
    }

    /// Number of packets sent.
    fn write_pkg_num(&self) -> u64 {
        self.core().write_pkg_num()
    }

    /// Increase the read packet counter. Internal bookkeeping.
    fn inc_read_pkg_num(&self) {
        self.core().inc_read_pkg_num();
    }

    /// Increase the write packet counter. Internal bookkeeping.
    fn inc_write_pkg_num(&self) {
        self.core().inc_write_pkg_num();
    }

    /// Refresh the last-active timestamp to now.
    fn update_active(&self) {
        self.core().update_active();
    }

    /// Last-active timestamp, as an absolute instant.
    fn active(&self) -> Instant {
        self.core().active()
    }

    /// Send an opaque payload to the peer, returning the number of payload
    /// bytes accepted. Arms the write deadline, runs the payload through the
    /// active compression filter where applicable, and updates counters only
    /// on success.
    fn send(&self, payload: Payload) -> impl Future<Output = Result<usize>> + Send;

    /// Close the connection. Idempotent: closing twice is a no-op.
    ///
    /// `linger` applies SO_LINGER before a stream teardown (`Some(0)` aborts
    /// with a reset); datagram and framed variants ignore it.
    fn close_conn(&self, linger: Option<Duration>) -> impl Future<Output = ()> + Send;

    /// Attach a non-owning back-reference to the owning session.
    ///
    /// Set once, post-construction; repeated calls are ignored. Used only to
    /// query the session's endpoint role.
    fn set_session(&self, session: Weak<dyn SessionRef>) {
        self.core().set_session(session);
    }
}
