//! UDP listener for DNS queries.
//!
//! Each datagram is decoded, handed to the [`Resolver`] on a spawned task,
//! and answered on the listening socket. Queries that resolve to
//! [`Resolution::Drop`](crate::resolver::Resolution::Drop) get no reply.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::dns::DnsQuery;
use crate::resolver::Resolver;

use super::MAX_DNS_PACKET_SIZE;

/// UDP listener bound to the configured address.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
}

impl UdpListener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start serving queries with `resolver`.
    pub fn start(self, resolver: Arc<Resolver>) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, resolver))
    }
}

async fn run(socket: Arc<UdpSocket>, resolver: Arc<Resolver>) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(err) => {
                debug!("UDP recv error: {err}");
                continue;
            }
        };

        let Some(query) = DnsQuery::parse(&buf[..len]) else {
            trace!(%src, len, "ignoring malformed query");
            continue;
        };

        let socket = Arc::clone(&socket);
        let resolver = Arc::clone(&resolver);
        tokio::spawn(async move {
            let Some(reply) = resolver.resolve(&query).await.into_reply(&query) else {
                return;
            };
            if let Err(err) = socket.send_to(&reply, src).await {
                warn!(%src, domain = %query.domain, "UDP response error: {err}");
            }
        });
    }
}
