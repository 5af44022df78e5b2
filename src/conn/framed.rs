//! WebSocket message-framed connection.

use super::{CompressType, ConnCore, Connection, Payload};
use crate::error::{ConfigErrorKind, Direction, Error, Result};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Close-frame reason sent to the peer on graceful shutdown.
const FAREWELL: &str = "bye-bye!!!";

/// Message-framed connection over a WebSocket.
///
/// Delivery is per message: the protocol preserves frame boundaries, so one
/// `send` becomes exactly one binary message. Each direction is serialized
/// behind its own async lock because the split halves are not safe for
/// concurrent use.
///
/// Two deliberate asymmetries against the other variants:
/// - `recv` never arms the read deadline; control frames keep the connection
///   looking live instead, via the last-active timestamp.
/// - compression is not negotiable on this transport, only
///   [`CompressType::None`] is accepted.
pub struct FramedConnection<S> {
    core: ConnCore,
    sink: AsyncMutex<Option<SplitSink<WebSocketStream<S>, Message>>>,
    stream: AsyncMutex<Option<SplitStream<WebSocketStream<S>>>>,
}

impl FramedConnection<TcpStream> {
    /// Wrap a WebSocket running over TCP, capturing the socket's addresses.
    pub fn from_tcp(ws: WebSocketStream<TcpStream>) -> Self {
        let local = ws
            .get_ref()
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let peer = ws
            .get_ref()
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Self::new(ws, local, peer)
    }
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket over an arbitrary byte stream.
    ///
    /// Address strings are informational only and carried verbatim.
    pub fn new(ws: WebSocketStream<S>, local: String, peer: String) -> Self {
        let (sink, stream) = ws.split();
        Self {
            core: ConnCore::new(local, peer),
            sink: AsyncMutex::new(Some(sink)),
            stream: AsyncMutex::new(Some(stream)),
        }
    }

    fn ws_err(&self, e: WsError) -> Error {
        match e {
            WsError::Io(e) => Error::io(self.core.id(), e),
            other => Error::io(self.core.id(), io::Error::other(other)),
        }
    }

    /// Receive the next data message, delivered whole.
    ///
    /// The read deadline is deliberately never armed here: the peer's ping
    /// and pong traffic refreshes the last-active timestamp instead, and an
    /// idle reaper watching that timestamp decides when the connection dies.
    /// Control frames are handled inline and the loop continues; a close
    /// frame or transport EOF drops the read half and surfaces as an I/O
    /// error.
    pub async fn recv(&self) -> Result<Bytes> {
        let mut guard = self.stream.lock().await;
        loop {
            let Some(stream) = guard.as_mut() else {
                return Err(Error::Closed {
                    conn_id: self.core.id(),
                });
            };
            let msg = match stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    tracing::warn!(
                        conn.id = self.core.id(),
                        conn.peer = self.core.remote_addr(),
                        error = %e,
                        "websocket read failed"
                    );
                    *guard = None;
                    return Err(self.ws_err(e));
                }
                None => {
                    *guard = None;
                    return Err(Error::io(
                        self.core.id(),
                        io::Error::new(io::ErrorKind::UnexpectedEof, "websocket stream ended"),
                    ));
                }
            };
            match msg {
                Message::Binary(data) => {
                    self.core.add_read_bytes(data.len() as u64);
                    self.core.inc_read_pkg_num();
                    self.core.update_active();
                    return Ok(Bytes::from(data));
                }
                Message::Text(text) => {
                    self.core.add_read_bytes(text.len() as u64);
                    self.core.inc_read_pkg_num();
                    self.core.update_active();
                    return Ok(Bytes::from(text.into_bytes()));
                }
                Message::Ping(payload) => {
                    self.core.update_active();
                    self.reply_pong(payload).await?;
                }
                Message::Pong(_) => {
                    self.core.update_active();
                }
                Message::Close(frame) => {
                    tracing::debug!(
                        conn.id = self.core.id(),
                        conn.peer = self.core.remote_addr(),
                        frame = ?frame,
                        "peer sent close frame"
                    );
                    *guard = None;
                    return Err(Error::io(
                        self.core.id(),
                        io::Error::new(io::ErrorKind::ConnectionReset, "peer closed websocket"),
                    ));
                }
                // Raw frames never surface from a read.
                Message::Frame(_) => {}
            }
        }
    }

    /// Answer a ping. A failure here is downgraded to a debug log when the
    /// sink is already closed or the write deadline expires; the read loop
    /// keeps running either way.
    async fn reply_pong(&self, payload: Vec<u8>) -> Result<()> {
        match self.send_control(Message::Pong(payload)).await {
            Ok(()) => Ok(()),
            Err(Error::Timeout { .. }) => {
                tracing::debug!(conn.id = self.core.id(), "pong reply timed out");
                Ok(())
            }
            Err(e) => match &e {
                Error::Io { source, .. }
                    if source.get_ref().is_some_and(|inner| {
                        matches!(
                            inner.downcast_ref::<WsError>(),
                            Some(WsError::ConnectionClosed | WsError::AlreadyClosed)
                        )
                    }) =>
                {
                    tracing::debug!(conn.id = self.core.id(), "pong reply after sink closed");
                    Ok(())
                }
                Error::Closed { .. } => Ok(()),
                _ => Err(e),
            },
        }
    }

    /// Send a ping carrying `payload`. The peer's pong refreshes the
    /// last-active timestamp when the read loop sees it.
    pub async fn ping(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.send_control(Message::Ping(payload.into())).await
    }

    async fn send_control(&self, msg: Message) -> Result<()> {
        let fut = async {
            let mut guard = self.sink.lock().await;
            let Some(sink) = guard.as_mut() else {
                return Err(Error::Closed {
                    conn_id: self.core.id(),
                });
            };
            sink.send(msg).await.map_err(|e| self.ws_err(e))
        };
        match self.core.write_timeout() {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| Error::timeout(self.core.id(), Direction::Write, d))?,
            None => fut.await,
        }
    }

    async fn send_binary(&self, payload: &Bytes) -> Result<usize> {
        self.send_control(Message::Binary(payload.to_vec())).await?;
        self.core.add_write_bytes(payload.len() as u64);
        self.core.inc_write_pkg_num();
        tracing::trace!(
            conn.id = self.core.id(),
            conn.peer = self.core.remote_addr(),
            conn.bytes = payload.len(),
            "framed send"
        );
        Ok(payload.len())
    }
}

impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn core(&self) -> &ConnCore {
        &self.core
    }

    /// Only [`CompressType::None`] is accepted: this transport has no
    /// per-message deflate support, and silently sending uncompressed data
    /// after accepting a mode would desynchronize the two sides.
    fn set_compress_type(&self, mode: CompressType) -> Result<()> {
        if mode != CompressType::None {
            return Err(Error::config(ConfigErrorKind::CompressionUnsupported {
                transport: "framed",
                mode: mode.name(),
            }));
        }
        Ok(())
    }

    async fn send(&self, payload: Payload) -> Result<usize> {
        match payload {
            Payload::Bytes(b) => self.send_binary(&b).await,
            other => Err(Error::PayloadMismatch {
                transport: "framed",
                expected: "bytes",
                got: other.kind(),
            }),
        }
    }

    /// Send a close frame with a farewell reason, then drop both halves.
    /// `linger` does not apply to this transport. Closing twice is a no-op.
    async fn close_conn(&self, _linger: Option<Duration>) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: FAREWELL.into(),
        };
        // The farewell is best effort, but still runs under the write
        // deadline: a stalled peer must not pin the close sequence.
        let farewell = async {
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                tracing::debug!(conn.id = self.core.id(), error = %e, "close frame not delivered");
            }
            let _ = sink.close().await;
        };
        match self.core.write_timeout() {
            Some(d) => {
                if tokio::time::timeout(d, farewell).await.is_err() {
                    tracing::debug!(conn.id = self.core.id(), "close frame timed out");
                }
            }
            None => farewell.await,
        }
        // A reader blocked in recv holds the stream lock; it will observe the
        // close handshake and drop its own half. Reap the half here only when
        // nobody is reading.
        if let Ok(mut guard) = self.stream.try_lock() {
            *guard = None;
        }
        tracing::debug!(
            conn.id = self.core.id(),
            conn.peer = self.core.remote_addr(),
            "framed connection closed"
        );
    }
}

impl<S> std::fmt::Debug for FramedConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, client_async};

    async fn pair() -> (FramedConnection<TcpStream>, WebSocketStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept_async(stream).await.unwrap()
        });
        let tcp = TcpStream::connect(addr).await.unwrap();
        let (ws, _) = client_async(format!("ws://{addr}"), tcp).await.unwrap();
        (FramedConnection::from_tcp(ws), server.await.unwrap())
    }

    #[tokio::test]
    async fn test_binary_send_roundtrip() {
        let (conn, mut server) = pair().await;
        let n = conn
            .send(Payload::Bytes(Bytes::from_static(b"framed message")))
            .await
            .unwrap();
        assert_eq!(n, 14);
        assert_eq!(conn.core().write_bytes(), 14);
        assert_eq!(conn.core().write_pkg_num(), 1);

        let msg = server.next().await.unwrap().unwrap();
        assert_eq!(msg.into_data(), b"framed message");
    }

    #[tokio::test]
    async fn test_recv_preserves_message_boundaries() {
        let (conn, mut server) = pair().await;
        server
            .send(Message::Binary(b"first".to_vec()))
            .await
            .unwrap();
        server
            .send(Message::Binary(b"second".to_vec()))
            .await
            .unwrap();
        assert_eq!(conn.recv().await.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(conn.recv().await.unwrap(), Bytes::from_static(b"second"));
        assert_eq!(conn.core().read_pkg_num(), 2);
        assert_eq!(conn.core().read_bytes(), 11);
    }

    #[tokio::test]
    async fn test_text_frames_surface_as_bytes() {
        let (conn, mut server) = pair().await;
        server
            .send(Message::Text("hello text".to_string()))
            .await
            .unwrap();
        assert_eq!(conn.recv().await.unwrap(), Bytes::from_static(b"hello text"));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong_inline() {
        let (conn, mut server) = pair().await;
        let conn = Arc::new(conn);
        let idle_since = conn.active();
        let reader = conn.clone();
        let handle = tokio::spawn(async move { reader.recv().await });

        server.send(Message::Ping(b"ka".to_vec())).await.unwrap();
        let echoed = server.next().await.unwrap().unwrap();
        assert_eq!(echoed, Message::Pong(b"ka".to_vec()));
        // Handling the ping refreshes the liveness timestamp.
        assert!(conn.active() > idle_since);

        server
            .send(Message::Binary(b"after ping".to_vec()))
            .await
            .unwrap();
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got, Bytes::from_static(b"after ping"));
    }

    #[tokio::test]
    async fn test_recv_ignores_read_deadline() {
        let (conn, mut server) = pair().await;
        conn.set_read_timeout(Duration::from_millis(20)).unwrap();
        let conn = Arc::new(conn);
        let reader = conn.clone();
        let handle = tokio::spawn(async move { reader.recv().await });

        // Well past the configured deadline; recv must still be waiting.
        tokio::time::sleep(Duration::from_millis(120)).await;
        server.send(Message::Binary(b"late".to_vec())).await.unwrap();
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn test_close_sends_farewell_frame() {
        let (conn, mut server) = pair().await;
        conn.close_conn(None).await;
        let msg = server.next().await.unwrap().unwrap();
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason, FAREWELL);
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_bounded_by_write_deadline_when_peer_stalls() {
        let (conn, server) = pair().await;
        conn.set_write_timeout(Duration::from_millis(100)).unwrap();

        // Stop reading on the peer and fill every buffer between the sink
        // and the socket until a send hits the deadline.
        let payload = Bytes::from(vec![0u8; 256 * 1024]);
        let mut stalled = false;
        for _ in 0..256 {
            if conn.send(Payload::Bytes(payload.clone())).await.is_err() {
                stalled = true;
                break;
            }
        }
        assert!(stalled, "send buffers never filled");

        let closed =
            tokio::time::timeout(Duration::from_secs(2), conn.close_conn(None)).await;
        assert!(closed.is_ok(), "close must respect the write deadline");
        drop(server);
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let (conn, _server) = pair().await;
        conn.close_conn(None).await;
        conn.close_conn(None).await;
        let err = conn.send(Payload::Bytes(Bytes::from_static(b"x"))).await;
        assert!(matches!(err, Err(Error::Closed { .. })));
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_as_io_error() {
        let (conn, mut server) = pair().await;
        server.close(None).await.unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        // The read half is gone; the next call reports closed.
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, Error::Closed { .. }));
    }

    #[tokio::test]
    async fn test_compression_rejected() {
        let (conn, _server) = pair().await;
        conn.set_compress_type(CompressType::None).unwrap();
        let err = conn.set_compress_type(CompressType::ZipDefault).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidConfig {
                kind: ConfigErrorKind::CompressionUnsupported { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_ping_helper_reaches_peer() {
        let (conn, mut server) = pair().await;
        conn.ping(b"probe".to_vec()).await.unwrap();
        let msg = server.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Ping(b"probe".to_vec()));
    }

    #[tokio::test]
    async fn test_vectored_payload_rejected() {
        let (conn, _server) = pair().await;
        let bufs: smallvec::SmallVec<[Bytes; 4]> =
            smallvec::smallvec![Bytes::from_static(b"a")];
        let err = conn.send(Payload::Vectored(bufs)).await.unwrap_err();
        assert!(matches!(err, Error::PayloadMismatch { .. }));
    }
}
