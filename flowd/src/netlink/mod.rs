//! Interface/route context for fireflies.
//!
//! Fireflies can carry a `netlink` object describing how the local host
//! reaches the flow destination: outgoing interface, its MTU, the next hop
//! and the preferred source address. The information comes from the kernel
//! routing table through an rtnetlink socket.

use std::{io, net::IpAddr, time::Duration};

use flowd_common::FlowId;
use serde::Serialize;
use thiserror::Error;

pub mod route;

pub use route::RouteContextProvider;

/// Route metadata for one flow. Built per lookup, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetlinkContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub ifindex: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pref_src: Option<IpAddr>,
}

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("failed to open netlink socket: {0}")]
    Socket(#[source] io::Error),

    #[error("netlink request failed: {0}")]
    Io(#[from] io::Error),

    #[error("kernel rejected netlink request: {0}")]
    Kernel(#[source] io::Error),

    #[error("failed to decode netlink message: {0}")]
    Decode(String),

    #[error("no netlink reply within {0:?}")]
    Timeout(Duration),

    #[error("no route to {0}")]
    NoRoute(IpAddr),

    #[error("unexpected netlink reply: {0}")]
    UnexpectedReply(&'static str),
}

/// Source of enrichment context for fireflies.
///
/// Lookups are best-effort: callers treat any error as "no context" and
/// carry on without it.
pub trait ContextProvider: Send + Sync {
    fn lookup(&self, flow: &FlowId) -> Result<NetlinkContext, NetlinkError>;
}
