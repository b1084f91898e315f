//! Multicast listener. Feeds every datagram heard to the node.

use std::net::{Ipv6Addr, SocketAddrV6};

use anyhow::{Context, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use pulse_services::{FrameCallback, FrameScanner, TransportError};

use super::{MulticastMedium, MULTICAST_ADDR};

/// Larger than any frame; oversized datagrams are not ours.
const RECV_BUF_LEN: usize = 1024;

impl FrameScanner for MulticastMedium {
    /// Spawns the receive loop. Must be called inside a tokio runtime.
    fn subscribe(&self, on_frame: FrameCallback) -> Result<(), TransportError> {
        let socket = self
            .recv_socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(TransportError::AlreadySubscribed)?;
        let socket = UdpSocket::from_std(socket)?;

        tracing::info!(port = self.port, "multicast listener starting");
        tokio::spawn(listener_loop(socket, on_frame));
        Ok(())
    }
}

/// Runs forever. Cancel by dropping the task handle.
async fn listener_loop(socket: UdpSocket, on_frame: FrameCallback) {
    let mut buf = vec![0u8; RECV_BUF_LEN];

    loop {
        let (len, peer_addr) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };
        if len == buf.len() {
            tracing::trace!(addr = %peer_addr, "oversized datagram, ignoring");
            continue;
        }
        tracing::trace!(addr = %peer_addr, bytes = len, "frame heard");
        on_frame(Bytes::copy_from_slice(&buf[..len]));
    }
}

/// Create a UDP socket joined to the ff02::1 multicast group.
pub(super) fn make_listener_socket(interface_index: u32, port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;

    socket
        .join_multicast_v6(&MULTICAST_ADDR, interface_index)
        .context("IPV6_JOIN_GROUP")?;

    Ok(socket.into())
}
