//! TCP byte-stream connection.

use super::compress::{ReadState, WriteFilter};
use super::{CompressType, ConnCore, Connection, Payload};
use crate::error::{Direction, Error, Result};
use bytes::Bytes;
use socket2::SockRef;
use std::io::{self, IoSlice};
use std::net::Shutdown;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;

/// Byte-stream connection over TCP.
///
/// I/O goes through the socket's readiness API (`try_read`/`try_write`),
/// which takes `&self`: the assumed one-concurrent-reader /
/// one-concurrent-writer usage needs no internal lock on the I/O path.
/// Compression filters are guarded by brief synchronous locks and never held
/// across an await.
pub struct StreamConnection {
    core: ConnCore,
    socket: Mutex<Option<Arc<TcpStream>>>,
    wfilter: Mutex<WriteFilter>,
    rstate: Mutex<ReadState>,
}

impl StreamConnection {
    /// Wrap an established TCP stream.
    ///
    /// Local and peer addresses are captured once here; they are never
    /// re-queried from the socket.
    pub fn new(stream: TcpStream) -> Self {
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        Self {
            core: ConnCore::new(local, peer),
            socket: Mutex::new(Some(Arc::new(stream))),
            wfilter: Mutex::new(WriteFilter::new(CompressType::None)),
            rstate: Mutex::new(ReadState::new(CompressType::None)),
        }
    }

    fn socket(&self) -> Result<Arc<TcpStream>> {
        self.socket
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::Closed {
                conn_id: self.core.id(),
            })
    }

    /// Read into `buf`, decompressing when a filter is active. Returns the
    /// number of bytes read; `Ok(0)` means the peer closed the stream.
    ///
    /// The read deadline is re-armed on every call rather than cached, and
    /// skipped while a compression filter is active (compressed streams do
    /// not use raw socket deadlines).
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let sock = self.socket()?;
        let plain = self.rstate.lock().unwrap().is_plain();
        if plain {
            let n = self.read_raw(&sock, buf).await?;
            self.core.add_read_bytes(n as u64);
            return Ok(n);
        }

        let mut scratch = vec![0u8; 16 * 1024];
        loop {
            {
                let mut rs = self.rstate.lock().unwrap();
                if !rs.decoded.is_empty() {
                    let n = rs.decoded.len().min(buf.len());
                    buf[..n].copy_from_slice(&rs.decoded.split_to(n));
                    self.core.add_read_bytes(n as u64);
                    return Ok(n);
                }
            }
            let n = self.read_raw(&sock, &mut scratch).await?;
            if n == 0 {
                return Ok(0);
            }
            self.rstate
                .lock()
                .unwrap()
                .decode(&scratch[..n])
                .map_err(|e| Error::compress(self.core.id(), e))?;
        }
    }

    async fn read_raw(&self, sock: &TcpStream, buf: &mut [u8]) -> Result<usize> {
        let deadline = if self.core.compress_type().is_active() {
            None
        } else {
            self.core.read_timeout()
        };
        let fut = async {
            loop {
                sock.readable()
                    .await
                    .map_err(|e| Error::io(self.core.id(), e))?;
                match sock.try_read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(Error::io(self.core.id(), e)),
                }
            }
        };
        match deadline {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| Error::timeout(self.core.id(), Direction::Read, d))?,
            None => fut.await,
        }
    }

    async fn send_bytes(&self, payload: &Bytes) -> Result<usize> {
        let sock = self.socket()?;
        let wire = self
            .wfilter
            .lock()
            .unwrap()
            .encode(payload)
            .map_err(|e| Error::compress(self.core.id(), e))?;
        let data: &[u8] = wire.as_deref().unwrap_or_else(|| payload.as_ref());
        self.write_armed(&sock, data).await?;
        self.core.add_write_bytes(payload.len() as u64);
        self.core.inc_write_pkg_num();
        tracing::trace!(
            conn.id = self.core.id(),
            conn.peer = self.core.remote_addr(),
            conn.bytes = payload.len(),
            "stream send"
        );
        Ok(payload.len())
    }

    /// Scatter write. Buffers bypass the compression filter and go to the
    /// socket with vectored I/O, one packet counted per buffer.
    async fn send_vectored(&self, bufs: &[Bytes]) -> Result<usize> {
        let sock = self.socket()?;
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let deadline = self.write_deadline();
        let fut = Self::write_vectored_all(&self.core, &sock, bufs);
        match deadline {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| Error::timeout(self.core.id(), Direction::Write, d))??,
            None => fut.await?,
        }
        self.core.add_write_bytes(total as u64);
        self.core.add_write_pkg_num(bufs.len() as u64);
        tracing::trace!(
            conn.id = self.core.id(),
            conn.peer = self.core.remote_addr(),
            conn.bytes = total,
            conn.buffers = bufs.len(),
            "stream scatter send"
        );
        Ok(total)
    }

    /// The write deadline, armed immediately before each write and skipped
    /// while a compression filter is active.
    fn write_deadline(&self) -> Option<Duration> {
        if self.core.compress_type().is_active() {
            None
        } else {
            self.core.write_timeout()
        }
    }

    async fn write_armed(&self, sock: &TcpStream, data: &[u8]) -> Result<()> {
        let fut = Self::write_all(&self.core, sock, data);
        match self.write_deadline() {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| Error::timeout(self.core.id(), Direction::Write, d))?,
            None => fut.await,
        }
    }

    async fn write_all(core: &ConnCore, sock: &TcpStream, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            sock.writable().await.map_err(|e| Error::io(core.id(), e))?;
            match sock.try_write(data) {
                Ok(0) => {
                    return Err(Error::io(
                        core.id(),
                        io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"),
                    ));
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::io(core.id(), e)),
            }
        }
        Ok(())
    }

    async fn write_vectored_all(core: &ConnCore, sock: &TcpStream, bufs: &[Bytes]) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut slices: Vec<IoSlice<'_>> = bufs.iter().map(|b| IoSlice::new(b)).collect();
        let mut slices: &mut [IoSlice<'_>] = &mut slices;
        let mut written = 0usize;
        while written < total {
            sock.writable().await.map_err(|e| Error::io(core.id(), e))?;
            match sock.try_write_vectored(slices) {
                Ok(0) => {
                    return Err(Error::io(
                        core.id(),
                        io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"),
                    ));
                }
                Ok(n) => {
                    written += n;
                    IoSlice::advance_slices(&mut slices, n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::io(core.id(), e)),
            }
        }
        Ok(())
    }
}

impl Connection for StreamConnection {
    fn core(&self) -> &ConnCore {
        &self.core
    }

    /// Rebuild both filter chains for `mode`. Every mode is legal on a
    /// byte stream.
    fn set_compress_type(&self, mode: CompressType) -> Result<()> {
        *self.wfilter.lock().unwrap() = WriteFilter::new(mode);
        *self.rstate.lock().unwrap() = ReadState::new(mode);
        self.core.set_compress(mode);
        tracing::debug!(
            conn.id = self.core.id(),
            compress = %mode,
            "stream compression reconfigured"
        );
        Ok(())
    }

    async fn send(&self, payload: Payload) -> Result<usize> {
        match payload {
            Payload::Bytes(b) => self.send_bytes(&b).await,
            Payload::Vectored(bufs) => self.send_vectored(&bufs).await,
            other => Err(Error::PayloadMismatch {
                transport: "stream",
                expected: "bytes or vectored bytes",
                got: other.kind(),
            }),
        }
    }

    /// Flush any pending filter output, apply the optional linger, and shut
    /// the socket down both ways so a parked reader unblocks. Closing twice
    /// is a no-op.
    async fn close_conn(&self, linger: Option<Duration>) {
        let Some(sock) = self.socket.lock().unwrap().take() else {
            return;
        };
        let finished = self.wfilter.lock().unwrap().finish();
        match finished {
            Ok(trailing) if !trailing.is_empty() => {
                if let Err(e) = Self::write_all(&self.core, &sock, &trailing).await {
                    tracing::debug!(
                        conn.id = self.core.id(),
                        error = %e,
                        "discarding trailing filter output at close"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn.id = self.core.id(), error = %e, "filter flush failed at close");
            }
        }
        let sockref = SockRef::from(&*sock);
        if linger.is_some() {
            let _ = sockref.set_linger(linger);
        }
        let _ = sockref.shutdown(Shutdown::Both);
        tracing::debug!(
            conn.id = self.core.id(),
            conn.peer = self.core.remote_addr(),
            "stream connection closed"
        );
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (StreamConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (StreamConnection::new(client), server)
    }

    async fn conn_pair() -> (StreamConnection, StreamConnection) {
        let (conn, server) = pair().await;
        (conn, StreamConnection::new(server))
    }

    #[tokio::test]
    async fn test_send_updates_counters() {
        let (conn, mut server) = pair().await;
        let payload = Bytes::from_static(b"0123456789");
        for _ in 0..3 {
            let n = conn.send(Payload::Bytes(payload.clone())).await.unwrap();
            assert_eq!(n, 10);
        }
        assert_eq!(conn.core().write_bytes(), 30);
        assert_eq!(conn.core().write_pkg_num(), 3);

        let mut buf = vec![0u8; 30];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..10], &payload[..]);
    }

    #[tokio::test]
    async fn test_vectored_send_counts_one_packet_per_buffer() {
        let (conn, mut server) = pair().await;
        let bufs: smallvec::SmallVec<[Bytes; 4]> = smallvec![
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"defg"),
            Bytes::from_static(b"hi"),
        ];
        let n = conn.send(Payload::Vectored(bufs)).await.unwrap();
        assert_eq!(n, 9);
        assert_eq!(conn.core().write_bytes(), 9);
        assert_eq!(conn.core().write_pkg_num(), 3);

        let mut buf = vec![0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"abcdefghi");
    }

    #[tokio::test]
    async fn test_recv_plain() {
        let (conn, mut server) = pair().await;
        server.write_all(b"hello stream").await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello stream");
        assert_eq!(conn.core().read_bytes(), n as u64);
    }

    #[tokio::test]
    async fn test_recv_deadline_expires() {
        let (conn, _server) = pair().await;
        conn.set_read_timeout(Duration::from_millis(30)).unwrap();
        let mut buf = [0u8; 16];
        let err = conn.recv(&mut buf).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_datagram_payload_rejected() {
        let (conn, _server) = pair().await;
        let err = conn
            .send(Payload::Datagram(super::super::DatagramContext::new(
                Bytes::from_static(b"x"),
                None,
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PayloadMismatch { .. }));
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let (conn, _server) = pair().await;
        conn.close_conn(None).await;
        conn.close_conn(Some(Duration::ZERO)).await;
        let err = conn.send(Payload::Bytes(Bytes::from_static(b"x"))).await;
        assert!(matches!(err, Err(Error::Closed { .. })));
    }

    #[tokio::test]
    async fn test_close_unblocks_parked_reader() {
        let (conn, _server) = pair().await;
        let conn = Arc::new(conn);
        let reader = conn.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.recv(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close_conn(None).await;
        let res = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reader should unblock")
            .unwrap();
        // Shutdown surfaces as EOF.
        assert!(matches!(res, Ok(0)));
    }

    async fn compressed_roundtrip(mode: CompressType) {
        let (a, b) = conn_pair().await;
        a.set_compress_type(mode).unwrap();
        b.set_compress_type(mode).unwrap();

        let messages: [&[u8]; 3] = [b"first payload", &[0x5A; 2000], b"last"];
        for msg in messages {
            a.send(Payload::Bytes(Bytes::copy_from_slice(msg)))
                .await
                .unwrap();
            let mut got = Vec::new();
            while got.len() < msg.len() {
                let mut buf = [0u8; 512];
                let n = b.recv(&mut buf).await.unwrap();
                assert!(n > 0, "unexpected EOF mid-message");
                got.extend_from_slice(&buf[..n]);
            }
            assert_eq!(&got[..], msg);
        }
        // Counters track uncompressed payload sizes on both sides.
        let total: u64 = messages.iter().map(|m| m.len() as u64).sum();
        assert_eq!(a.core().write_bytes(), total);
        assert_eq!(b.core().read_bytes(), total);
    }

    #[tokio::test]
    async fn test_deflate_roundtrip_over_loopback() {
        compressed_roundtrip(CompressType::ZipDefault).await;
    }

    #[tokio::test]
    async fn test_snappy_roundtrip_over_loopback() {
        compressed_roundtrip(CompressType::Snappy).await;
    }
}
