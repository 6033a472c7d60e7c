//! IPv6 UDP multicast transport for the control channel.
//!
//! One socket per control-channel interface, bound to the interface-specific
//! port with address reuse, outgoing multicast pinned to the interface by
//! kernel index, and joined to the interface-specific group. The transport is
//! connectionless and duplicate-prone on purpose; duplicate suppression
//! happens in the codec layer.

pub mod codec;

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::comms::codec::ControlMessage;
use crate::config::MulticastEndpoint;
use crate::error::{Error, Result};
use crate::util;

/// MTU budget for one control frame.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Receive loops wake up this often to observe the shutdown flag.
const RECV_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// One joined multicast socket on a control-channel interface.
pub struct MulticastChannel {
    interface: String,
    socket: UdpSocket,
    destination: SocketAddrV6,
}

impl MulticastChannel {
    /// Open the control-channel socket for one interface.
    pub fn open(interface: &str, endpoint: &MulticastEndpoint) -> Result<Self> {
        let ifindex = util::interface_index(interface)?;

        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::transport(interface, e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::transport(interface, e))?;
        let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, endpoint.port, 0, 0);
        socket
            .bind(&SockAddr::from(bind_addr))
            .map_err(|e| Error::transport(interface, e))?;
        socket
            .set_multicast_if_v6(ifindex)
            .map_err(|e| Error::transport(interface, e))?;
        socket
            .join_multicast_v6(&endpoint.group, ifindex)
            .map_err(|e| Error::transport(interface, e))?;
        socket
            .set_read_timeout(Some(RECV_POLL_TIMEOUT))
            .map_err(|e| Error::transport(interface, e))?;

        let destination = SocketAddrV6::new(endpoint.group, endpoint.port, 0, ifindex);
        log::info!(
            "Joined multicast group [{}]:{} on interface {interface}",
            endpoint.group,
            endpoint.port
        );
        Ok(MulticastChannel {
            interface: interface.to_string(),
            socket: socket.into(),
            destination,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Serialize and send one control message to the interface's group.
    pub fn send(&self, message: &ControlMessage) -> Result<()> {
        let frame = codec::encode(message)?;
        self.socket
            .send_to(frame.as_bytes(), self.destination)
            .map_err(|e| Error::transport(&self.interface, e))?;
        Ok(())
    }

    /// Receive one datagram into `buf`.
    ///
    /// Returns `Ok(None)` when the poll timeout elapsed without data so the
    /// caller can check its shutdown flag and try again.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Open a channel per configured control-channel interface.
///
/// An interface that is down or fails socket setup is skipped with a log
/// line; the daemon keeps operating over the remaining interfaces.
pub fn open_channels(
    interfaces: &[String],
    endpoints: impl Fn(&str) -> Result<MulticastEndpoint>,
) -> Vec<Arc<MulticastChannel>> {
    let mut channels = Vec::new();
    for interface in interfaces {
        if !util::interface_operstate(interface) {
            log::info!(
                "Radio interface [{interface}] is not up, cannot create a multicast socket on it"
            );
            continue;
        }
        let endpoint = match endpoints(interface) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log::error!("No multicast endpoint for {interface}: {e}");
                continue;
            }
        };
        match MulticastChannel::open(interface, &endpoint) {
            Ok(channel) => channels.push(Arc::new(channel)),
            Err(e) => log::error!("Failed to open control channel on {interface}: {e}"),
        }
    }
    channels
}

/// Send one message on every channel, `repeat` times per channel.
///
/// BCQI alerts use `repeat == 2` to survive loss on the unreliable control
/// channel; everything else goes out once per socket. Send failures are
/// logged and do not stop the remaining sockets.
pub fn broadcast(channels: &[Arc<MulticastChannel>], message: &ControlMessage, repeat: usize) {
    for _ in 0..repeat {
        for channel in channels {
            match channel.send(message) {
                Ok(()) => log::debug!("Sent {} on {}", message.payload.a_id, channel.interface()),
                Err(e) => log::error!("Error sending data to {}: {e}", channel.interface()),
            }
        }
    }
}

/// Outbound fan-out seam for the FSMs.
///
/// Production delivers over the joined multicast channels; tests substitute
/// a recording sink.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: &ControlMessage, repeat: usize);
}

/// [`MessageSink`] over the per-interface multicast channels.
pub struct ChannelSink {
    channels: Vec<Arc<MulticastChannel>>,
}

impl ChannelSink {
    pub fn new(channels: Vec<Arc<MulticastChannel>>) -> Self {
        ChannelSink { channels }
    }
}

impl MessageSink for ChannelSink {
    fn deliver(&self, message: &ControlMessage, repeat: usize) {
        broadcast(&self.channels, message, repeat);
    }
}
