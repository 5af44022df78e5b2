//! UDP datagram connection.

use super::{CompressType, ConnCore, Connection, DatagramContext, Payload};
use crate::error::{Direction, Error, Result};
use crate::session::EndpointRole;
use socket2::SockRef;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Packet-oriented connection over UDP.
///
/// Sends take a [`DatagramContext`]: the destination inside it is optional on
/// a connected socket and mandatory when the owning session acts as a
/// connectionless listener. Payloads travel uncompressed; a selected
/// compression mode is recorded but never applied to the wire.
pub struct DatagramConnection {
    core: ConnCore,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl DatagramConnection {
    /// Wrap a bound UDP socket.
    ///
    /// The peer address is captured when the socket is connected and left
    /// empty otherwise.
    pub fn new(socket: UdpSocket) -> Self {
        let local = socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let peer = socket.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        Self {
            core: ConnCore::new(local, peer),
            socket: Mutex::new(Some(Arc::new(socket))),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::Closed {
                conn_id: self.core.id(),
            })
    }

    /// Receive one datagram, returning its length and source address. The
    /// read deadline is re-armed on every call.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let sock = self.socket()?;
        let fut = async {
            sock.recv_from(buf)
                .await
                .map_err(|e| Error::io(self.core.id(), e))
        };
        let (n, from) = match self.core.read_timeout() {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| Error::timeout(self.core.id(), Direction::Read, d))??,
            None => fut.await?,
        };
        self.core.add_read_bytes(n as u64);
        self.core.inc_read_pkg_num();
        Ok((n, from))
    }

    async fn send_datagram(&self, ctx: &DatagramContext) -> Result<usize> {
        let sock = self.socket()?;
        if ctx.peer.is_none() && self.core.endpoint_role() == EndpointRole::Listener {
            return Err(Error::MissingDestination {
                conn_id: self.core.id(),
            });
        }
        let fut = async {
            match ctx.peer {
                Some(addr) => sock.send_to(&ctx.data, addr).await,
                None => sock.send(&ctx.data).await,
            }
            .map_err(|e| Error::io(self.core.id(), e))
        };
        let n = match self.core.write_timeout() {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| Error::timeout(self.core.id(), Direction::Write, d))??,
            None => fut.await?,
        };
        self.core.add_write_bytes(n as u64);
        self.core.inc_write_pkg_num();
        tracing::trace!(
            conn.id = self.core.id(),
            conn.peer = ?ctx.peer,
            conn.bytes = n,
            "datagram send"
        );
        Ok(n)
    }
}

impl Connection for DatagramConnection {
    fn core(&self) -> &ConnCore {
        &self.core
    }

    /// Record the selected mode. Datagram payloads are never run through a
    /// filter, so this only affects what [`ConnCore::compress_type`] reports.
    fn set_compress_type(&self, mode: CompressType) -> Result<()> {
        self.core.set_compress(mode);
        Ok(())
    }

    async fn send(&self, payload: Payload) -> Result<usize> {
        match payload {
            Payload::Datagram(ctx) => self.send_datagram(&ctx).await,
            other => Err(Error::PayloadMismatch {
                transport: "datagram",
                expected: "datagram context",
                got: other.kind(),
            }),
        }
    }

    /// Drop the socket. `linger` has no effect on UDP and is ignored.
    /// Closing twice is a no-op.
    async fn close_conn(&self, _linger: Option<Duration>) {
        let Some(sock) = self.socket.lock().unwrap().take() else {
            return;
        };
        // Best effort: unblocks a parked reader on connected sockets. An
        // unconnected socket may not support shutdown on every platform.
        let _ = SockRef::from(&*sock).shutdown(Shutdown::Both);
        tracing::debug!(
            conn.id = self.core.id(),
            conn.peer = self.core.remote_addr(),
            "datagram connection closed"
        );
    }
}

impl std::fmt::Debug for DatagramConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramConnection")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use bytes::Bytes;

    async fn bound() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_send_to_explicit_destination() {
        let a = bound().await;
        let b = bound().await;
        let dest = b.local_addr().unwrap();
        let conn = DatagramConnection::new(a);

        let n = conn
            .send(Payload::Datagram(DatagramContext::new(
                Bytes::from_static(b"ping"),
                Some(dest),
            )))
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(conn.core().write_bytes(), 4);
        assert_eq!(conn.core().write_pkg_num(), 1);

        let mut buf = [0u8; 16];
        let (got, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..got], b"ping");
    }

    #[tokio::test]
    async fn test_connected_send_without_destination() {
        let a = bound().await;
        let b = bound().await;
        a.connect(b.local_addr().unwrap()).await.unwrap();
        let conn = DatagramConnection::new(a);
        assert!(!conn.remote_addr().is_empty());

        conn.send(Payload::Datagram(DatagramContext::new(
            Bytes::from_static(b"hi"),
            None,
        )))
        .await
        .unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
    }

    #[tokio::test]
    async fn test_listener_role_requires_destination() {
        let session = Session::new(
            DatagramConnection::new(bound().await),
            EndpointRole::Listener,
        );
        let err = session
            .send(DatagramContext::new(Bytes::from_static(b"x"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingDestination { .. }));
        assert_eq!(session.conn().core().write_pkg_num(), 0);
    }

    #[tokio::test]
    async fn test_recv_from_roundtrip() {
        let a = bound().await;
        let b = bound().await;
        let dest = a.local_addr().unwrap();
        let conn = DatagramConnection::new(a);

        b.send_to(b"datagram body", dest).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram body");
        assert_eq!(from, b.local_addr().unwrap());
        assert_eq!(conn.core().read_bytes(), n as u64);
        assert_eq!(conn.core().read_pkg_num(), 1);
    }

    #[tokio::test]
    async fn test_recv_deadline_expires() {
        let conn = DatagramConnection::new(bound().await);
        conn.set_read_timeout(Duration::from_millis(30)).unwrap();
        let mut buf = [0u8; 16];
        let err = conn.recv_from(&mut buf).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_bytes_payload_rejected() {
        let conn = DatagramConnection::new(bound().await);
        let err = conn
            .send(Payload::Bytes(Bytes::from_static(b"raw")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PayloadMismatch { .. }));
    }

    #[tokio::test]
    async fn test_compress_mode_recorded_not_applied() {
        let a = bound().await;
        let b = bound().await;
        let dest = b.local_addr().unwrap();
        let conn = DatagramConnection::new(a);
        conn.set_compress_type(CompressType::Snappy).unwrap();
        assert_eq!(conn.core().compress_type(), CompressType::Snappy);

        conn.send(Payload::Datagram(DatagramContext::new(
            Bytes::from_static(b"plain on the wire"),
            Some(dest),
        )))
        .await
        .unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"plain on the wire");
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let conn = DatagramConnection::new(bound().await);
        conn.close_conn(None).await;
        conn.close_conn(Some(Duration::ZERO)).await;
        let err = conn
            .send(Payload::Datagram(DatagramContext::new(
                Bytes::from_static(b"x"),
                None,
            )))
            .await;
        assert!(matches!(err, Err(Error::Closed { .. })));
    }
}
