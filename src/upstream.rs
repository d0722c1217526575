//! Upstream resolver transactions over UDP.
//!
//! One [`Upstream`] is bound per resolver address. Outstanding queries are
//! keyed by their 16-bit transaction ID; a background task reads responses
//! and completes the matching query. Each transaction resolves exactly once,
//! either by its response or by its timeout.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::dns::{self, DnsQuestion, DnsRecord, DnsResponse, HEADER_LEN, ResponseCode};
use crate::error::UpstreamError;
use crate::transport::MAX_DNS_PACKET_SIZE;

/// Outcome of forwarding one question.
pub type Forwarded = Result<Vec<DnsRecord>, UpstreamError>;

/// Something that answers a question with records, typically a resolver.
pub trait Forwarder: Send + Sync {
    fn forward<'a>(&'a self, question: &'a DnsQuestion) -> BoxFuture<'a, Forwarded>;
}

struct Pending {
    issued_at: Instant,
    domain: String,
    reply: oneshot::Sender<Forwarded>,
}

struct Inner {
    addr: SocketAddr,
    socket: UdpSocket,
    pending: Mutex<FxHashMap<u16, Pending>>,
    timeout: Duration,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, FxHashMap<u16, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a transaction ID not currently in flight.
    fn register(&self, question: &DnsQuestion, reply: oneshot::Sender<Forwarded>) -> Option<u16> {
        let mut pending = self.pending();
        if pending.len() > u16::MAX as usize {
            return None;
        }
        loop {
            let id = rand::random::<u16>();
            if let std::collections::hash_map::Entry::Vacant(slot) = pending.entry(id) {
                slot.insert(Pending {
                    issued_at: Instant::now(),
                    domain: question.domain.clone(),
                    reply,
                });
                return Some(id);
            }
        }
    }

    fn take(&self, id: u16) -> Option<Pending> {
        self.pending().remove(&id)
    }

    /// Complete the transaction a datagram belongs to.
    ///
    /// Returns false when no transaction is waiting for its ID.
    fn complete(&self, datagram: &[u8]) -> bool {
        if datagram.len() < HEADER_LEN {
            return false;
        }
        let id = u16::from_be_bytes([datagram[0], datagram[1]]);

        let Some(pending) = self.take(id) else {
            trace!(upstream = %self.addr, id, "dropping unmatched response");
            return false;
        };

        let result = match DnsResponse::parse(datagram) {
            Some(response) if response.code() == ResponseCode::NoError => Ok(response.answers),
            Some(response) => Err(UpstreamError::Response {
                code: response.code(),
                records: response.answers,
            }),
            None => {
                warn!(upstream = %self.addr, id, domain = %pending.domain, "malformed upstream response");
                Err(UpstreamError::Malformed)
            }
        };

        debug!(
            upstream = %self.addr,
            id,
            domain = %pending.domain,
            elapsed_ms = pending.issued_at.elapsed().as_secs_f64() * 1000.0,
            "upstream answered"
        );
        // The waiter may already be gone; nothing to do then.
        let _ = pending.reply.send(result);
        true
    }
}

/// Correlates queries and responses for one upstream resolver.
pub struct Upstream {
    inner: Arc<Inner>,
    receiver: JoinHandle<()>,
}

impl Upstream {
    /// Bind an ephemeral socket connected to `addr` and start reading responses.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        let inner = Arc::new(Inner {
            addr,
            socket,
            pending: Mutex::new(FxHashMap::default()),
            timeout,
        });
        let receiver = tokio::spawn(receive_loop(Arc::clone(&inner)));

        Ok(Self { inner, receiver })
    }

    /// Number of transactions awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.inner.pending().len()
    }

    /// Feed an inbound datagram to the correlator, as the receive loop does.
    pub fn deliver(&self, datagram: &[u8]) -> bool {
        self.inner.complete(datagram)
    }

    /// Send `question` upstream and wait for its answer or the timeout.
    pub async fn send(&self, question: &DnsQuestion) -> Forwarded {
        let (tx, mut rx) = oneshot::channel();
        let Some(id) = self.inner.register(question, tx) else {
            return Err(UpstreamError::Exhausted);
        };

        let packet = dns::encode_query(id, question);
        if let Err(err) = self.inner.socket.send(&packet).await {
            self.inner.take(id);
            return Err(UpstreamError::Transport(err));
        }

        match tokio::time::timeout(self.inner.timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpstreamError::Closed),
            Err(_) => {
                if self.inner.take(id).is_some() {
                    debug!(upstream = %self.inner.addr, id, domain = %question.domain, "upstream timed out");
                    return Err(UpstreamError::Timeout);
                }
                // The response won the race against the deadline.
                rx.try_recv().unwrap_or(Err(UpstreamError::Timeout))
            }
        }
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

impl Forwarder for Upstream {
    fn forward<'a>(&'a self, question: &'a DnsQuestion) -> BoxFuture<'a, Forwarded> {
        self.send(question).boxed()
    }
}

async fn receive_loop(inner: Arc<Inner>) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let len = match inner.socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(err) => {
                // ICMP unreachable surfaces here on some platforms; keep reading.
                debug!(upstream = %inner.addr, "upstream recv error: {err}");
                continue;
            }
        };
        inner.complete(&buf[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{CLASS_IN, DnsQuery, rtype};

    fn question(domain: &str) -> DnsQuestion {
        DnsQuestion {
            domain: domain.to_string(),
            qtype: rtype::A,
            qclass: CLASS_IN,
        }
    }

    /// Answer built by a fake resolver for a received query packet.
    fn answer_for(packet: &[u8], code: ResponseCode, address: Ipv4Addr) -> Vec<u8> {
        let query = DnsQuery::parse(packet).unwrap();
        let records = if code == ResponseCode::NoError {
            vec![DnsRecord::a(query.domain.clone(), address, 120)]
        } else {
            Vec::new()
        };
        DnsResponse::reply(&query, code, records).to_bytes()
    }

    async fn fake_resolver() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn send_returns_matching_answer() {
        let (server, addr) = fake_resolver().await;
        let upstream = Upstream::connect(addr, Duration::from_secs(2)).await.unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, src) = server.recv_from(&mut buf).await.unwrap();
            let reply = answer_for(&buf[..len], ResponseCode::NoError, Ipv4Addr::new(5, 6, 7, 8));
            server.send_to(&reply, src).await.unwrap();
        });

        let records = upstream.send(&question("example.com")).await.unwrap();
        responder.await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ipv4(), Some(Ipv4Addr::new(5, 6, 7, 8)));
        assert_eq!(upstream.in_flight(), 0);
    }

    #[tokio::test]
    async fn error_code_is_returned_as_typed_failure() {
        let (server, addr) = fake_resolver().await;
        let upstream = Upstream::connect(addr, Duration::from_secs(2)).await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, src) = server.recv_from(&mut buf).await.unwrap();
            let reply = answer_for(&buf[..len], ResponseCode::NxDomain, Ipv4Addr::UNSPECIFIED);
            server.send_to(&reply, src).await.unwrap();
        });

        let err = upstream.send(&question("missing.example")).await.unwrap_err();

        assert_eq!(err.code(), Some(ResponseCode::NxDomain));
    }

    #[tokio::test]
    async fn duplicate_response_completes_only_once() {
        let (server, addr) = fake_resolver().await;
        let upstream = Arc::new(Upstream::connect(addr, Duration::from_secs(2)).await.unwrap());

        let (packet_tx, packet_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, _) = server.recv_from(&mut buf).await.unwrap();
            let _ = packet_tx.send(buf[..len].to_vec());
        });

        let sender = Arc::clone(&upstream);
        let request = tokio::spawn(async move { sender.send(&question("example.com")).await });

        let packet = packet_rx.await.unwrap();
        let reply = answer_for(&packet, ResponseCode::NoError, Ipv4Addr::new(1, 2, 3, 4));

        assert!(upstream.deliver(&reply));
        assert!(!upstream.deliver(&reply));

        let records = request.await.unwrap().unwrap();
        assert_eq!(records[0].ipv4(), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(upstream.in_flight(), 0);
    }

    #[tokio::test]
    async fn timeout_fails_and_frees_transaction_id() {
        let (_server, addr) = fake_resolver().await;
        let upstream = Upstream::connect(addr, Duration::from_millis(50)).await.unwrap();

        let err = upstream.send(&question("slow.example")).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Timeout));
        assert_eq!(upstream.in_flight(), 0);
    }

    #[tokio::test]
    async fn send_failure_frees_transaction_id() {
        let (_server, addr) = fake_resolver().await;
        let upstream = Upstream::connect(addr, Duration::from_secs(2)).await.unwrap();
        // Larger than any UDP datagram, so the send itself fails.
        let label = "a".repeat(63);
        let domain = vec![label.as_str(); 1100].join(".");

        let err = upstream.send(&question(&domain)).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Transport(_)));
        assert_eq!(upstream.in_flight(), 0);
    }

    #[tokio::test]
    async fn register_skips_ids_in_flight() {
        let (_server, addr) = fake_resolver().await;
        let upstream = Upstream::connect(addr, Duration::from_secs(1)).await.unwrap();
        let mut receivers = Vec::new();
        {
            let mut pending = upstream.inner.pending();
            for id in 0..u16::MAX {
                let (tx, rx) = oneshot::channel();
                receivers.push(rx);
                pending.insert(
                    id,
                    Pending {
                        issued_at: Instant::now(),
                        domain: String::new(),
                        reply: tx,
                    },
                );
            }
        }

        let (tx, _rx) = oneshot::channel();
        let id = upstream.inner.register(&question("last.example"), tx);
        assert_eq!(id, Some(u16::MAX));

        let err = upstream.send(&question("full.example")).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Exhausted));
        assert_eq!(upstream.in_flight(), usize::from(u16::MAX) + 1);
    }

    #[tokio::test]
    async fn unmatched_datagram_is_ignored() {
        let (_server, addr) = fake_resolver().await;
        let upstream = Upstream::connect(addr, Duration::from_secs(1)).await.unwrap();
        let stray = DnsResponse {
            id: 4242,
            flags: 0x8180,
            questions: vec![question("stray.example")],
            answers: vec![],
        };

        assert!(!upstream.deliver(&stray.to_bytes()));
        assert!(!upstream.deliver(&[0u8; 4]));
    }

    #[tokio::test]
    async fn malformed_response_fails_transaction() {
        let (server, addr) = fake_resolver().await;
        let upstream = Upstream::connect(addr, Duration::from_secs(2)).await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, src) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = answer_for(&buf[..len], ResponseCode::NoError, Ipv4Addr::new(1, 1, 1, 1));
            reply.truncate(reply.len() - 3);
            server.send_to(&reply, src).await.unwrap();
        });

        let err = upstream.send(&question("broken.example")).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Malformed));
    }
}
