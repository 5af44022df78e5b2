//! Socket construction helpers.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Create and bind a UDP socket suitable for a [`DatagramConnection`].
///
/// IPv6 addresses are bound dual-stack (`IPV6_V6ONLY = false`) so one socket
/// serves both families; bind to `[::]:port` to get that behavior. Address
/// reuse is enabled for quick restarts.
///
/// `recv_buffer_size` requests a larger kernel receive buffer to ride out
/// datagram bursts; the kernel may cap the value (`net.core.rmem_max` on
/// Linux) and a failed request is ignored.
///
/// [`DatagramConnection`]: crate::DatagramConnection
pub async fn bind_udp_socket(
    addr: SocketAddr,
    recv_buffer_size: Option<usize>,
) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_reuse_address(true)?;

    if let Some(size) = recv_buffer_size {
        let _ = socket.set_recv_buffer_size(size);
    }

    // Non-blocking must be set before handing the fd to tokio.
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_udp_socket_ipv4() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = bind_udp_socket(addr, None).await.unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.is_ipv4());
        assert_ne!(local.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_udp_socket_ipv6() {
        let addr: SocketAddr = "[::1]:0".parse().unwrap();
        let socket = bind_udp_socket(addr, None).await.unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.is_ipv6());
        assert_ne!(local.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_udp_socket_with_buffer_size() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = bind_udp_socket(addr, Some(1024 * 1024)).await.unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }
}
