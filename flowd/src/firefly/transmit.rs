//! Datagram transmission for fireflies.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    #[error("failed to send firefly to {dst}: {source}")]
    Send {
        dst: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no IPv6 socket available to reach {0}")]
    NoIpv6Socket(SocketAddr),

    #[error("short write to {dst}: sent {sent} of {len} bytes")]
    ShortWrite {
        dst: SocketAddr,
        sent: usize,
        len: usize,
    },
}

/// One unacknowledged write per call. No retries, no queuing.
#[async_trait]
pub trait Transmit: Send + Sync {
    async fn send(&self, payload: &[u8], dst: SocketAddr) -> Result<usize, TransmitError>;
}

/// UDP transmitter holding one socket per address family.
///
/// The IPv4 socket is mandatory. The IPv6 one is opened when the host
/// supports it; without it IPv6 destinations fail per event.
#[derive(Debug)]
pub struct UdpTransmitter {
    v4: UdpSocket,
    v6: Option<UdpSocket>,
}

impl UdpTransmitter {
    pub async fn bind() -> Result<Self, BackendError> {
        let v4_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let v4 = UdpSocket::bind(v4_addr)
            .await
            .map_err(|e| BackendError::bind_socket("Firefly", v4_addr.to_string(), e))?;

        let v6_addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0));
        let v6 = match UdpSocket::bind(v6_addr).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!(
                    event.name = "firefly.transmit.ipv6_unavailable",
                    error.message = %e,
                    "could not open IPv6 socket, IPv6 fireflies will be dropped"
                );
                None
            }
        };

        debug!(
            event.name = "firefly.transmit.bound",
            local.v4 = ?v4.local_addr().ok(),
            local.v6 = ?v6.as_ref().and_then(|s| s.local_addr().ok()),
            "firefly sockets bound"
        );

        Ok(Self { v4, v6 })
    }
}

#[async_trait]
impl Transmit for UdpTransmitter {
    async fn send(&self, payload: &[u8], dst: SocketAddr) -> Result<usize, TransmitError> {
        let socket = match dst {
            SocketAddr::V4(_) => &self.v4,
            SocketAddr::V6(_) => self.v6.as_ref().ok_or(TransmitError::NoIpv6Socket(dst))?,
        };

        let sent = socket
            .send_to(payload, dst)
            .await
            .map_err(|source| TransmitError::Send { dst, source })?;

        if sent != payload.len() {
            return Err(TransmitError::ShortWrite {
                dst,
                sent,
                len: payload.len(),
            });
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_datagram_to_loopback() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = receiver.local_addr().unwrap();
        let transmitter = UdpTransmitter::bind().await.expect("should bind");

        let sent = transmitter.send(b"firefly", dst).await.expect("should send");
        assert_eq!(sent, 7);

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"firefly");
    }

    #[tokio::test]
    async fn ipv6_destination_without_ipv6_socket_fails() {
        let transmitter = UdpTransmitter {
            v4: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            v6: None,
        };
        let dst: SocketAddr = "[::1]:10514".parse().unwrap();

        let err = transmitter.send(b"firefly", dst).await.unwrap_err();
        assert!(matches!(err, TransmitError::NoIpv6Socket(addr) if addr == dst));
    }
}
