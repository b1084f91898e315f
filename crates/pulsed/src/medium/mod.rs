//! Link-local multicast as the broadcast medium.
//!
//! Every frame is one UDP datagram sent to ff02::1 on a single interface
//! with hop limit 1, so it reaches exactly the devices on the same link.
//! That is the closest a plain network gets to a radio advertisement:
//! no addressing, no acknowledgement, no delivery guarantee.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::Mutex;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use pulse_services::{FrameSender, TransportError};

pub mod listener;

/// All-nodes link-local multicast group.
pub const MULTICAST_ADDR: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

pub struct MulticastMedium {
    send_socket: Socket,
    dest: SockAddr,
    /// Taken by the first subscriber.
    recv_socket: Mutex<Option<std::net::UdpSocket>>,
    port: u16,
}

impl MulticastMedium {
    pub fn bind(interface_index: u32, port: u16) -> Result<Self> {
        let send_socket = make_send_socket(interface_index)
            .context("failed to create multicast send socket")?;
        let recv_socket = listener::make_listener_socket(interface_index, port)
            .context("failed to create multicast listener socket")?;

        let dest = SocketAddrV6::new(MULTICAST_ADDR, port, 0, interface_index);
        tracing::info!(interface_index, port, "multicast medium bound");

        Ok(Self {
            send_socket,
            dest: dest.into(),
            recv_socket: Mutex::new(Some(recv_socket)),
            port,
        })
    }
}

impl FrameSender for MulticastMedium {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let n = self.send_socket.send_to(frame, &self.dest)?;
        tracing::trace!(bytes = n, "frame sent");
        Ok(())
    }
}

/// Create a UDP socket suitable for sending IPv6 multicast.
fn make_send_socket(interface_index: u32) -> Result<Socket> {
    let socket =
        Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket
        .set_multicast_if_v6(interface_index)
        .context("IPV6_MULTICAST_IF")?;
    // TTL 1: link-local only, do not route beyond this link
    socket
        .set_multicast_hops_v6(1)
        .context("IPV6_MULTICAST_HOPS")?;
    // a device never hears its own broadcasts
    socket
        .set_multicast_loop_v6(false)
        .context("IPV6_MULTICAST_LOOP")?;
    // a send that would block is a lost frame, not a stalled actor
    socket.set_nonblocking(true).context("set_nonblocking")?;

    Ok(socket)
}

/// Get the OS interface index for a named network interface.
/// Returns an error if the interface does not exist.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

/// First interface that is not loopback, in kernel index order.
pub fn default_interface() -> Result<String> {
    let mut names = Vec::new();
    unsafe {
        let list = libc::if_nameindex();
        if list.is_null() {
            anyhow::bail!("if_nameindex failed: {}", std::io::Error::last_os_error());
        }
        let mut entry = list;
        while (*entry).if_index != 0 {
            let name = std::ffi::CStr::from_ptr((*entry).if_name);
            names.push(name.to_string_lossy().into_owned());
            entry = entry.add(1);
        }
        libc::if_freenameindex(list);
    }
    names
        .into_iter()
        .find(|n| n != "lo")
        .context("no non-loopback interface found")
}
