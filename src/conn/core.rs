//! Shared per-connection state: identity, counters, timeout policy.

use super::{CompressType, instant_from_offset, next_conn_id, offset_since_launch};
use crate::error::{ConfigErrorKind, Error, Result};
use crate::session::{EndpointRole, SessionRef};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Identity, statistics, and timeout policy composed into every transport
/// variant.
///
/// Counters are only ever incremented or overwritten, never
/// compared-and-swapped, so relaxed atomics are sufficient and no lock is
/// held on any I/O path. Byte and packet counters wrap at `u64::MAX`; the
/// active-time offset wraps after roughly 584 years of process uptime.
pub struct ConnCore {
    id: u32,
    local: String,
    peer: String,
    compress: AtomicU8,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    read_pkg_num: AtomicU64,
    write_pkg_num: AtomicU64,
    /// Last-active time, nanoseconds since the process-launch epoch.
    active: AtomicU64,
    /// Read deadline in nanoseconds; 0 means unset.
    r_timeout: AtomicU64,
    /// Write deadline in nanoseconds; 0 means unset.
    w_timeout: AtomicU64,
    session: OnceLock<Weak<dyn SessionRef>>,
}

impl ConnCore {
    /// Allocate a fresh id and capture both address strings.
    ///
    /// Addresses are cached here and never re-queried from the socket.
    pub(crate) fn new(local: String, peer: String) -> Self {
        Self {
            id: next_conn_id(),
            local,
            peer,
            compress: AtomicU8::new(CompressType::None.as_u8()),
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            read_pkg_num: AtomicU64::new(0),
            write_pkg_num: AtomicU64::new(0),
            active: AtomicU64::new(0),
            r_timeout: AtomicU64::new(0),
            w_timeout: AtomicU64::new(0),
            session: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn local_addr(&self) -> &str {
        &self.local
    }

    pub fn remote_addr(&self) -> &str {
        &self.peer
    }

    pub(crate) fn set_compress(&self, mode: CompressType) {
        self.compress.store(mode.as_u8(), Ordering::Relaxed);
    }

    /// The currently selected compression mode.
    pub fn compress_type(&self) -> CompressType {
        CompressType::from_u8(self.compress.load(Ordering::Relaxed))
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }

    pub fn read_pkg_num(&self) -> u64 {
        self.read_pkg_num.load(Ordering::Relaxed)
    }

    pub fn write_pkg_num(&self) -> u64 {
        self.write_pkg_num.load(Ordering::Relaxed)
    }

    pub(crate) fn add_read_bytes(&self, n: u64) {
        self.read_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_write_bytes(&self, n: u64) {
        self.write_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_read_pkg_num(&self) {
        self.read_pkg_num.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_write_pkg_num(&self) {
        self.write_pkg_num.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_write_pkg_num(&self, n: u64) {
        self.write_pkg_num.fetch_add(n, Ordering::Relaxed);
    }

    /// Overwrite the last-active timestamp with now.
    pub fn update_active(&self) {
        self.active.store(offset_since_launch(), Ordering::Relaxed);
    }

    /// Last-active timestamp as an absolute instant.
    pub fn active(&self) -> Instant {
        instant_from_offset(self.active.load(Ordering::Relaxed))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        nanos_to_timeout(self.r_timeout.load(Ordering::Relaxed))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        nanos_to_timeout(self.w_timeout.load(Ordering::Relaxed))
    }

    /// Set the read deadline. When the write deadline is unset, the value is
    /// mirrored into it so a half-configured connection never writes
    /// unbounded.
    pub fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        let nanos = timeout_to_nanos(timeout)?;
        self.r_timeout.store(nanos, Ordering::Relaxed);
        let _ = self
            .w_timeout
            .compare_exchange(0, nanos, Ordering::Relaxed, Ordering::Relaxed);
        Ok(())
    }

    /// Set the write deadline, mirroring into an unset read deadline.
    pub fn set_write_timeout(&self, timeout: Duration) -> Result<()> {
        let nanos = timeout_to_nanos(timeout)?;
        self.w_timeout.store(nanos, Ordering::Relaxed);
        let _ = self
            .r_timeout
            .compare_exchange(0, nanos, Ordering::Relaxed, Ordering::Relaxed);
        Ok(())
    }

    /// Store the non-owning session back-reference. First call wins.
    pub(crate) fn set_session(&self, session: Weak<dyn SessionRef>) {
        let _ = self.session.set(session);
    }

    /// Upgrade the session back-reference, if one was set and is still alive.
    pub(crate) fn session(&self) -> Option<Arc<dyn SessionRef>> {
        self.session.get().and_then(Weak::upgrade)
    }

    /// The owning session's endpoint role. Defaults to connection-oriented
    /// when no session is attached.
    pub(crate) fn endpoint_role(&self) -> EndpointRole {
        self.session()
            .map(|s| s.endpoint_role())
            .unwrap_or(EndpointRole::Connected)
    }
}

impl std::fmt::Debug for ConnCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnCore")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("compress", &self.compress_type())
            .field("read_bytes", &self.read_bytes())
            .field("write_bytes", &self.write_bytes())
            .finish_non_exhaustive()
    }
}

fn nanos_to_timeout(nanos: u64) -> Option<Duration> {
    (nanos != 0).then(|| Duration::from_nanos(nanos))
}

fn timeout_to_nanos(timeout: Duration) -> Result<u64> {
    if timeout.is_zero() {
        return Err(Error::config(ConfigErrorKind::ZeroTimeout));
    }
    // Saturate rather than wrap for absurdly long deadlines.
    Ok(u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX))
}
