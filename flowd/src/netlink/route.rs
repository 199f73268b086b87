//! rtnetlink based [`ContextProvider`].
//!
//! Each lookup issues an `RTM_GETROUTE` for the flow destination and, when the
//! kernel names an output interface, an `RTM_GETLINK` for that interface.
//! Requests are synchronous request/reply exchanges on a private,
//! non-blocking `NETLINK_ROUTE` socket. A reply that does not show up within
//! the reply timeout fails the lookup.

use std::{
    io::{self, ErrorKind},
    net::IpAddr,
    sync::atomic::{AtomicU32, Ordering},
    thread,
    time::{Duration, Instant},
};

use flowd_common::FlowId;
use netlink_packet_core::{NLM_F_REQUEST, NetlinkHeader, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::{
    AddressFamily, RouteNetlinkMessage,
    link::{LinkAttribute, LinkMessage},
    route::{RouteAddress, RouteAttribute, RouteMessage},
};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use tracing::trace;

use super::{ContextProvider, NetlinkContext, NetlinkError};

/// Default time a lookup waits for each kernel reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(100);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct RouteContextProvider {
    socket: Socket,
    sequence: AtomicU32,
    reply_timeout: Duration,
}

impl RouteContextProvider {
    pub fn new() -> Result<Self, NetlinkError> {
        Self::with_reply_timeout(DEFAULT_REPLY_TIMEOUT)
    }

    pub fn with_reply_timeout(reply_timeout: Duration) -> Result<Self, NetlinkError> {
        let mut socket = Socket::new(NETLINK_ROUTE).map_err(NetlinkError::Socket)?;
        socket.bind_auto().map_err(NetlinkError::Socket)?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(NetlinkError::Socket)?;
        socket.set_non_blocking(true).map_err(NetlinkError::Socket)?;

        Ok(Self {
            socket,
            sequence: AtomicU32::new(1),
            reply_timeout,
        })
    }

    fn route_to(&self, dst: IpAddr) -> Result<RouteMessage, NetlinkError> {
        let mut msg = RouteMessage::default();
        match dst {
            IpAddr::V4(addr) => {
                msg.header.address_family = AddressFamily::Inet;
                msg.header.destination_prefix_length = 32;
                msg.attributes
                    .push(RouteAttribute::Destination(RouteAddress::Inet(addr)));
            }
            IpAddr::V6(addr) => {
                msg.header.address_family = AddressFamily::Inet6;
                msg.header.destination_prefix_length = 128;
                msg.attributes
                    .push(RouteAttribute::Destination(RouteAddress::Inet6(addr)));
            }
        }

        match self.request(RouteNetlinkMessage::GetRoute(msg))? {
            RouteNetlinkMessage::NewRoute(route) => Ok(route),
            _ => Err(NetlinkError::UnexpectedReply("expected RTM_NEWROUTE")),
        }
    }

    fn link(&self, index: u32) -> Result<LinkMessage, NetlinkError> {
        let mut msg = LinkMessage::default();
        msg.header.index = index;

        match self.request(RouteNetlinkMessage::GetLink(msg))? {
            RouteNetlinkMessage::NewLink(link) => Ok(link),
            _ => Err(NetlinkError::UnexpectedReply("expected RTM_NEWLINK")),
        }
    }

    /// Sends one request and waits for the reply carrying its sequence number.
    fn request(&self, message: RouteNetlinkMessage) -> Result<RouteNetlinkMessage, NetlinkError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST;
        header.sequence_number = sequence;

        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
        packet.finalize();
        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf[..]);

        self.socket.send(&buf, 0)?;
        self.recv_reply(sequence)
    }

    /// Reads replies until one carries `sequence` or the reply timeout passes.
    fn recv_reply(&self, sequence: u32) -> Result<RouteNetlinkMessage, NetlinkError> {
        let deadline = Instant::now() + self.reply_timeout;

        loop {
            let bytes = match self.socket.recv_from_full() {
                Ok((bytes, _)) => bytes,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(NetlinkError::Timeout(self.reply_timeout));
                    }
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let mut offset = 0;
            while offset < bytes.len() {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&bytes[offset..])
                    .map_err(|e| NetlinkError::Decode(e.to_string()))?;
                let length = msg.header.length as usize;

                if msg.header.sequence_number == sequence {
                    match msg.payload {
                        NetlinkPayload::InnerMessage(reply) => return Ok(reply),
                        NetlinkPayload::Error(err) => {
                            if let Some(code) = err.code {
                                return Err(NetlinkError::Kernel(io::Error::from_raw_os_error(
                                    -code.get(),
                                )));
                            }
                            return Err(NetlinkError::UnexpectedReply("ack without payload"));
                        }
                        _ => {}
                    }
                } else {
                    trace!(
                        event.name = "netlink.route.stale_reply",
                        expected = sequence,
                        got = msg.header.sequence_number,
                        "skipping netlink reply for another request"
                    );
                }

                if length == 0 {
                    break;
                }
                offset += (length + 3) & !3; // NLMSG_ALIGN
            }

            if Instant::now() >= deadline {
                return Err(NetlinkError::Timeout(self.reply_timeout));
            }
        }
    }
}

impl ContextProvider for RouteContextProvider {
    fn lookup(&self, flow: &FlowId) -> Result<NetlinkContext, NetlinkError> {
        let dst = flow.dst.ip();
        let route = self.route_to(dst)?;

        let mut ctx = NetlinkContext {
            interface: None,
            ifindex: 0,
            mtu: None,
            gateway: None,
            pref_src: None,
        };

        for attr in &route.attributes {
            match attr {
                RouteAttribute::Oif(index) => ctx.ifindex = *index,
                RouteAttribute::Gateway(addr) => ctx.gateway = route_address(addr),
                RouteAttribute::PrefSource(addr) => ctx.pref_src = route_address(addr),
                _ => {}
            }
        }

        if ctx.ifindex == 0 {
            return Err(NetlinkError::NoRoute(dst));
        }

        let link = self.link(ctx.ifindex)?;
        for attr in &link.attributes {
            match attr {
                LinkAttribute::IfName(name) => ctx.interface = Some(name.clone()),
                LinkAttribute::Mtu(mtu) => ctx.mtu = Some(*mtu),
                _ => {}
            }
        }

        Ok(ctx)
    }
}

fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}
