//! Netlink sockets for neighbor and route events
//!
//! One socket per kernel notification group set. Each socket decodes the
//! datagrams it receives into [`KernelEvent`]s; anything the agent cannot use
//! (unknown message types, missing attributes, unresolvable interface
//! indices) is dropped here with a trace log.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Kernel interface for network state
//! - SI-4: System Monitoring - Monitor neighbor and route table changes
//! - SI-10: Information Input Validation - Defensive message decoding

#[cfg(target_os = "linux")]
mod linux {
    use crate::error::{FlowsyncError, Result};
    use crate::types::{
        KernelEvent, MacAddress, NeighborEvent, NeighborMessageType, RouteEvent,
        RouteMessageType,
    };
    use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST};
    use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
    use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    #[cfg(feature = "perf-fxhash")]
    use rustc_hash::FxHashMap as HashMap;
    #[cfg(not(feature = "perf-fxhash"))]
    use std::collections::HashMap;
    use std::collections::hash_map::Entry;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, instrument, trace, warn};

    /// Legacy multicast group bits (linux/rtnetlink.h)
    const RTMGRP_NEIGH: u32 = 0x4;
    const RTMGRP_IPV4_MROUTE: u32 = 0x20;
    const RTMGRP_IPV4_ROUTE: u32 = 0x40;
    const RTMGRP_IPV6_MROUTE: u32 = 0x200;
    const RTMGRP_IPV6_ROUTE: u32 = 0x400;

    /// Kernel receive queue requested per socket; dumps arrive in bursts
    const SOCKET_RCVBUF_BYTES: libc::c_int = 1 << 20;

    /// Per-datagram receive buffer
    const RECV_BUFFER_SIZE: usize = 65536;

    /// Size of `struct nlmsghdr`
    const NLMSG_HEADER_LEN: usize = 16;

    /// ifindex to interface name, filled lazily from `if_indextoname`
    ///
    /// Backed by FxHashMap with the `perf-fxhash` feature.
    #[derive(Debug, Default)]
    pub struct InterfaceCache {
        names: HashMap<u32, String>,
    }

    impl InterfaceCache {
        pub fn get(&self, ifindex: u32) -> Option<&str> {
            self.names.get(&ifindex).map(String::as_str)
        }

        pub fn insert(&mut self, ifindex: u32, name: String) {
            self.names.insert(ifindex, name);
        }

        /// Name of `ifindex`, asking the kernel on a cache miss
        pub fn resolve(&mut self, ifindex: u32) -> Result<&str> {
            if let Entry::Vacant(slot) = self.names.entry(ifindex) {
                let name = nix::net::if_::if_indextoname(ifindex)
                    .map_err(|_| FlowsyncError::InterfaceNotFound(ifindex))?;
                slot.insert(name.to_string_lossy().into_owned());
            }
            self.get(ifindex)
                .ok_or(FlowsyncError::InterfaceNotFound(ifindex))
        }
    }

    /// Which kernel table a socket mirrors
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Subscription {
        Neighbors,
        Routes,
    }

    impl Subscription {
        fn groups(&self) -> u32 {
            match self {
                Self::Neighbors => RTMGRP_NEIGH,
                Self::Routes => {
                    RTMGRP_IPV4_MROUTE | RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_MROUTE | RTMGRP_IPV6_ROUTE
                }
            }
        }
    }

    /// `setsockopt` for an int-valued option
    fn set_int_option(
        fd: RawFd,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> std::io::Result<()> {
        // SAFETY: `value` outlives the call and the length matches its type.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                (&value as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Add `O_NONBLOCK` to the descriptor's status flags
    fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
        // SAFETY: plain fcntl calls on a descriptor we own.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// A bound NETLINK_ROUTE socket for one subscription
    pub struct NetlinkSocket {
        socket: Socket,
        subscription: Subscription,
        /// Cleared before every recv
        buffer: Vec<u8>,
        interfaces: InterfaceCache,
    }

    impl NetlinkSocket {
        /// Open a socket and join the subscription's multicast groups
        ///
        /// # NIST Controls
        /// - AC-3: Access Enforcement - Kernel socket requires CAP_NET_ADMIN
        #[instrument]
        pub fn new(subscription: Subscription) -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| FlowsyncError::Netlink(format!("socket(NETLINK_ROUTE): {}", e)))?;
            socket
                .bind(&SocketAddr::new(0, subscription.groups()))
                .map_err(|e| {
                    FlowsyncError::Netlink(format!("bind {:?} groups: {}", subscription, e))
                })?;

            let fd = socket.as_raw_fd();
            match set_int_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, SOCKET_RCVBUF_BYTES) {
                Ok(()) => trace!(bytes = SOCKET_RCVBUF_BYTES, "Receive buffer enlarged"),
                Err(e) => warn!(error = %e, "SO_RCVBUF rejected, keeping kernel default"),
            }
            // Overruns drop messages instead of failing recv with ENOBUFS
            if let Err(e) = set_int_option(fd, libc::SOL_NETLINK, libc::NETLINK_NO_ENOBUFS, 1) {
                warn!(error = %e, "NETLINK_NO_ENOBUFS rejected");
            }

            debug!(?subscription, groups = subscription.groups(), "Netlink socket bound");

            Ok(Self {
                socket,
                subscription,
                buffer: Vec::with_capacity(RECV_BUFFER_SIZE),
                interfaces: InterfaceCache::default(),
            })
        }

        pub fn subscription(&self) -> Subscription {
            self.subscription
        }

        pub fn as_raw_fd(&self) -> RawFd {
            self.socket.as_raw_fd()
        }

        /// Request a dump of the subscribed kernel table
        ///
        /// Dump replies arrive as ordinary "new" messages on this socket.
        #[instrument(skip(self), fields(subscription = ?self.subscription))]
        pub fn request_dump(&mut self) -> Result<()> {
            let inner = match self.subscription {
                Subscription::Neighbors => {
                    RouteNetlinkMessage::GetNeighbour(NeighbourMessage::default())
                }
                Subscription::Routes => RouteNetlinkMessage::GetRoute(RouteMessage::default()),
            };
            let mut request = NetlinkMessage::from(inner);
            request.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
            request.finalize();

            let mut wire = vec![0u8; request.buffer_len()];
            request.serialize(&mut wire);
            self.socket
                .send(&wire, 0)
                .map_err(|e| FlowsyncError::Netlink(format!("dump request: {}", e)))?;

            debug!("Requested kernel table dump");
            Ok(())
        }

        /// Read and decode one datagram without blocking
        ///
        /// `Ok(None)` means the socket had nothing queued.
        pub fn try_receive_events(&mut self) -> Result<Option<Vec<KernelEvent>>> {
            self.buffer.clear();
            match self.socket.recv(&mut self.buffer, libc::MSG_DONTWAIT) {
                Ok(len) => {
                    let len = len.min(self.buffer.len());
                    Ok(Some(parse_datagram(&self.buffer[..len], &mut self.interfaces)))
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(FlowsyncError::Netlink(format!("Failed to receive: {}", e))),
            }
        }
    }

    /// Parse one received datagram into events
    ///
    /// A message that fails to decode is skipped by its header length; a
    /// header that cannot be trusted ends processing of the datagram.
    pub fn parse_datagram(buf: &[u8], cache: &mut InterfaceCache) -> Vec<KernelEvent> {
        let mut events = Vec::new();
        let mut offset = 0;

        while offset + NLMSG_HEADER_LEN <= buf.len() {
            let bytes = &buf[offset..];
            let msg_len = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
            if msg_len < NLMSG_HEADER_LEN || msg_len > bytes.len() {
                warn!(offset, msg_len, "Truncated netlink message, dropping rest of datagram");
                break;
            }

            match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&bytes[..msg_len]) {
                Ok(msg) => {
                    if let Some(event) = decode_message(&msg, cache) {
                        events.push(event);
                    }
                }
                Err(e) => {
                    warn!(offset, error = %e, "Skipping undecodable netlink message");
                }
            }

            // NLMSG_ALIGN
            offset += (msg_len + 3) & !3;
        }

        trace!(count = events.len(), "Received kernel events");
        events
    }

    /// Decode one netlink message into a kernel event
    pub fn decode_message(
        msg: &NetlinkMessage<RouteNetlinkMessage>,
        cache: &mut InterfaceCache,
    ) -> Option<KernelEvent> {
        match &msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(n)) => {
                decode_neighbor(NeighborMessageType::New, n, cache).map(KernelEvent::Neighbor)
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelNeighbour(n)) => {
                decode_neighbor(NeighborMessageType::Delete, n, cache).map(KernelEvent::Neighbor)
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(r)) => {
                decode_route(RouteMessageType::New, r, cache).map(KernelEvent::Route)
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRoute(r)) => {
                decode_route(RouteMessageType::Delete, r, cache).map(KernelEvent::Route)
            }
            _ => None,
        }
    }

    /// Decode a neighbor message
    pub fn decode_neighbor(
        kind: NeighborMessageType,
        msg: &NeighbourMessage,
        cache: &mut InterfaceCache,
    ) -> Option<NeighborEvent> {
        if !matches!(msg.header.family, AddressFamily::Inet | AddressFamily::Inet6) {
            trace!(family = ?msg.header.family, "Ignoring non-IP neighbor");
            return None;
        }

        let ifindex = msg.header.ifindex;
        let interface = match cache.resolve(ifindex) {
            Ok(name) => name.to_string(),
            Err(_) => {
                trace!(ifindex, "Ignoring neighbor on unresolvable interface");
                return None;
            }
        };

        let mut address: Option<IpAddr> = None;
        let mut hw_address: Option<MacAddress> = None;

        for attr in &msg.attributes {
            match attr {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(v4)) => {
                    address = Some(IpAddr::V4(*v4));
                }
                NeighbourAttribute::Destination(NeighbourAddress::Inet6(v6)) => {
                    address = Some(IpAddr::V6(*v6));
                }
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    hw_address = MacAddress::from_slice(bytes);
                }
                _ => {}
            }
        }

        let Some(address) = address else {
            trace!(ifindex, "Neighbor message missing IP address");
            return None;
        };

        Some(NeighborEvent {
            kind,
            interface,
            address,
            hw_address,
        })
    }

    /// Decode a route message
    ///
    /// Top-level gateway and output interface win; otherwise the first
    /// multipath next hop supplies them.
    pub fn decode_route(
        kind: RouteMessageType,
        msg: &RouteMessage,
        cache: &mut InterfaceCache,
    ) -> Option<RouteEvent> {
        let unspecified = match msg.header.address_family {
            AddressFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            other => {
                trace!(family = ?other, "Ignoring non-IP route");
                return None;
            }
        };

        let mut table = u32::from(msg.header.table);
        let mut destination: Option<IpAddr> = None;
        let mut gateway: Option<IpAddr> = None;
        let mut oif: Option<u32> = None;
        let mut nexthop_gateway: Option<IpAddr> = None;
        let mut nexthop_oif: Option<u32> = None;

        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(addr) => destination = route_address(addr),
                RouteAttribute::Gateway(addr) => gateway = route_address(addr),
                RouteAttribute::Oif(index) => oif = Some(*index),
                RouteAttribute::Table(id) => table = *id,
                RouteAttribute::MultiPath(hops) => {
                    if let Some(first) = hops.first() {
                        nexthop_oif = Some(first.interface_index);
                        nexthop_gateway = first.attributes.iter().find_map(|a| match a {
                            RouteAttribute::Gateway(addr) => route_address(addr),
                            _ => None,
                        });
                    }
                }
                _ => {}
            }
        }

        let gateway = gateway.or(nexthop_gateway);
        let interface = oif
            .or(nexthop_oif)
            .and_then(|index| cache.resolve(index).ok().map(str::to_string));

        Some(RouteEvent {
            kind,
            table,
            destination: destination.unwrap_or(unspecified),
            prefix_len: msg.header.destination_prefix_length,
            gateway,
            interface,
        })
    }

    fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
        match addr {
            RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
            RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
            _ => None,
        }
    }

    /// Netlink socket driven by the tokio reactor
    ///
    /// The reactor polls a duplicate of the socket's descriptor; the original
    /// stays owned by the `netlink_sys::Socket` that performs the I/O.
    pub struct AsyncNetlinkSocket {
        readiness: AsyncFd<OwnedFd>,
        socket: NetlinkSocket,
    }

    impl AsyncNetlinkSocket {
        /// # NIST Controls
        /// - AC-3: Access Enforcement - Requires CAP_NET_ADMIN
        #[instrument]
        pub fn new(subscription: Subscription) -> Result<Self> {
            let socket = NetlinkSocket::new(subscription)?;
            let fd = socket.as_raw_fd();
            set_nonblocking(fd).map_err(|e| {
                FlowsyncError::Netlink(format!("O_NONBLOCK on {:?} socket: {}", subscription, e))
            })?;

            // SAFETY: `fd` is open for as long as `socket` lives, and the
            // borrow ends once the duplicate exists.
            let dup = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
            let readiness = AsyncFd::new(dup)?;

            debug!(?subscription, "Registered netlink socket with the reactor");
            Ok(Self { readiness, socket })
        }

        /// Subscribe to neighbor-table notifications
        pub fn neighbors() -> Result<Self> {
            Self::new(Subscription::Neighbors)
        }

        /// Subscribe to IPv4/IPv6 unicast and multicast route notifications
        pub fn routes() -> Result<Self> {
            Self::new(Subscription::Routes)
        }

        /// Wait for the next datagram and decode it
        ///
        /// The batch may be empty when nothing in the datagram was usable.
        pub async fn recv_events(&mut self) -> Result<Vec<KernelEvent>> {
            loop {
                let mut ready = self.readiness.readable().await?;
                match self.socket.try_receive_events()? {
                    Some(events) => return Ok(events),
                    None => ready.clear_ready(),
                }
            }
        }

        pub fn request_dump(&mut self) -> Result<()> {
            self.socket.request_dump()
        }

        pub fn subscription(&self) -> Subscription {
            self.socket.subscription()
        }
    }

}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Stand-in for platforms without rtnetlink; never yields events
#[cfg(not(target_os = "linux"))]
mod mock {
    use crate::error::Result;
    use crate::types::KernelEvent;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Subscription {
        Neighbors,
        Routes,
    }

    pub struct AsyncNetlinkSocket {
        subscription: Subscription,
    }

    impl AsyncNetlinkSocket {
        pub fn new(subscription: Subscription) -> Result<Self> {
            Ok(Self { subscription })
        }

        pub fn neighbors() -> Result<Self> {
            Self::new(Subscription::Neighbors)
        }

        pub fn routes() -> Result<Self> {
            Self::new(Subscription::Routes)
        }

        pub async fn recv_events(&mut self) -> Result<Vec<KernelEvent>> {
            std::future::pending::<()>().await;
            Ok(Vec::new())
        }

        pub fn request_dump(&mut self) -> Result<()> {
            Ok(())
        }

        pub fn subscription(&self) -> Subscription {
            self.subscription
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
