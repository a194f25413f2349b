//! Datagram transport: socket setup, the non-blocking receive seam, and the
//! background send pool.
//!
//! Receives are polled without blocking from the scheduler thread. Sends
//! are queued onto a bounded channel drained by a small fixed pool of
//! workers, which await socket writability instead of spinning on
//! "would block".

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::codec;
use crate::error::NetworkError;

/// Default receive scratch size. Larger datagrams take a one-off buffer.
pub const DEFAULT_SCRATCH_LEN: usize = 2048;

/// Largest datagram we are prepared to receive.
pub const MAX_DATAGRAM_LEN: usize = 65_536;

/// How long [`SendPool::shutdown`] waits for the workers to drain.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

/// The socket operations the transports rely on.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Receive one pending datagram without blocking. `Ok(None)` means
    /// nothing is queued.
    fn try_recv_datagram(&self, scratch: &mut [u8]) -> io::Result<Option<Datagram>>;

    /// Send without blocking; fails with `WouldBlock` under backpressure.
    fn try_send_datagram(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// Send, waiting for the socket to become writable.
    async fn send_datagram(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

fn would_block_as_none<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    fn try_recv_datagram(&self, scratch: &mut [u8]) -> io::Result<Option<Datagram>> {
        let peeked = match self.try_peek_from(scratch) {
            Ok((n, _)) => Some(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            // Some platforms report an oversize datagram as a peek error.
            Err(_) => None,
        };

        if let Some(n) = peeked.filter(|&n| n < scratch.len()) {
            let Some((len, from)) = would_block_as_none(self.try_recv_from(scratch))? else {
                return Ok(None);
            };
            debug_assert_eq!(len, n);
            return Ok(Some(Datagram {
                data: scratch[..len].to_vec(),
                from,
            }));
        }

        // The peek filled the scratch buffer, so the datagram may be larger.
        let mut large = vec![0u8; MAX_DATAGRAM_LEN];
        let Some((len, from)) = would_block_as_none(self.try_recv_from(&mut large))? else {
            return Ok(None);
        };
        large.truncate(len);
        Ok(Some(Datagram { data: large, from }))
    }

    fn try_send_datagram(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.try_send_to(payload, to)
    }

    async fn send_datagram(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.send_to(payload, to).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Receive at most `budget` datagrams from `socket`, handing each to
/// `handle`. Stops early when nothing is pending or on a receive error.
/// Returns the number of datagrams received.
pub fn drain_budget(
    socket: &dyn DatagramSocket,
    scratch: &mut [u8],
    budget: usize,
    mut handle: impl FnMut(Datagram),
) -> usize {
    let mut received = 0;
    while received < budget {
        match socket.try_recv_datagram(scratch) {
            Ok(Some(datagram)) => {
                received += 1;
                handle(datagram);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Receive failed, ending this poll: {e}");
                break;
            }
        }
    }
    received
}

/// Per-transport diagnostics counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub received: u64,
    pub accepted: u64,
    pub dropped: u64,
    /// Accepted packets at least one handler reported as interpreted.
    pub interpreted: u64,
}

impl TransportStats {
    pub fn record_accepted(&mut self, interpreted: bool) {
        self.received += 1;
        self.accepted += 1;
        if interpreted {
            self.interpreted += 1;
        }
    }

    pub fn record_dropped(&mut self) {
        self.received += 1;
        self.dropped += 1;
    }
}

// ---------------------------------------------------------------------------
// Socket setup
// ---------------------------------------------------------------------------

/// Bind a non-blocking socket that has joined `group`.
///
/// Address reuse lets several processes on one host share the group, and
/// loopback stays on so same-host peers (and our own echo) are received.
pub fn bind_multicast(group: SocketAddrV4, ttl: u32) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()));
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_nonblocking(true)?;

    let socket = UdpSocket::from_std(socket.into())?;
    info!("Joined multicast group {group}");
    Ok(socket)
}

/// Bind a non-blocking unicast socket, used for router relays.
pub fn bind_unicast(port: u16) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket)?;
    info!("Router socket bound on {}", DatagramSocket::local_addr(&socket)?);
    Ok(socket)
}

// ---------------------------------------------------------------------------
// In-memory socket
// ---------------------------------------------------------------------------

/// A socket backed by in-memory queues, for tests and offline embedding.
///
/// Received datagrams are injected with [`inject`](Self::inject); sent
/// datagrams are collected and drained with [`take_sent`](Self::take_sent).
pub struct MemorySocket {
    addr: SocketAddr,
    inbox: Mutex<VecDeque<Datagram>>,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl MemorySocket {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            inbox: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Queue a datagram for the next receive.
    pub fn inject(&self, data: Vec<u8>, from: SocketAddr) {
        self.inbox.lock().push_back(Datagram { data, from });
    }

    /// Number of datagrams waiting to be received.
    pub fn pending(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Drain everything sent so far as `(destination, bytes)`.
    pub fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl DatagramSocket for MemorySocket {
    fn try_recv_datagram(&self, _scratch: &mut [u8]) -> io::Result<Option<Datagram>> {
        Ok(self.inbox.lock().pop_front())
    }

    fn try_send_datagram(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.sent.lock().push((to, payload.to_vec()));
        Ok(payload.len())
    }

    async fn send_datagram(&self, payload: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.try_send_datagram(payload, to)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

// ---------------------------------------------------------------------------
// Send pool
// ---------------------------------------------------------------------------

/// Where the send workers deliver a bus packet.
#[derive(Clone)]
pub struct SendTarget {
    pub multicast: Arc<dyn DatagramSocket>,
    pub unicast: Option<Arc<dyn DatagramSocket>>,
    pub group: SocketAddr,
    pub routers: Arc<RwLock<HashSet<SocketAddr>>>,
    pub sender_tag: u32,
}

impl SendTarget {
    /// Unicast to every router (failures ignored), then multicast.
    async fn deliver(&self, packet: &[u8]) {
        if let Some(unicast) = &self.unicast {
            let routers: Vec<SocketAddr> = self.routers.read().iter().copied().collect();
            for router in routers {
                if let Err(e) = unicast.send_datagram(packet, router).await {
                    trace!("Router send to {router} failed: {e}");
                }
            }
        }

        let framed = codec::with_overhead(self.sender_tag, packet);
        if let Err(e) = self.multicast.send_datagram(&framed, self.group).await {
            debug!("Multicast send failed: {e}");
        }
    }
}

/// Cloneable handle onto the send pool's queue.
///
/// Every clone shares one sender, so [`close`](Self::close) ends the queue
/// for all of them at once.
#[derive(Clone)]
pub struct SendQueue {
    tx: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
}

impl SendQueue {
    /// Queue an encoded packet. Never waits.
    pub fn enqueue(&self, packet: Vec<u8>) -> Result<(), NetworkError> {
        let tx = self.tx.read();
        let tx = tx.as_ref().ok_or(NetworkError::NetworkingDisabled)?;
        tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NetworkError::NetworkingDisabled,
        })
    }

    pub fn is_open(&self) -> bool {
        self.tx.read().is_some()
    }

    /// Stop accepting packets. Already queued packets are still sent.
    pub fn close(&self) {
        self.tx.write().take();
    }
}

/// Bounded outbound queue drained by a fixed pool of workers.
pub struct SendPool {
    queue: SendQueue,
    workers: Vec<JoinHandle<()>>,
}

impl SendPool {
    /// Spawn `workers` tasks on the current tokio runtime.
    pub fn spawn(workers: usize, capacity: usize, target: SendTarget) -> Self {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                let target = target.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(packet) = next else { break };
                        target.deliver(&packet).await;
                    }
                    trace!("Send worker {id} exiting");
                })
            })
            .collect();

        Self {
            queue: SendQueue {
                tx: Arc::new(RwLock::new(Some(tx))),
            },
            workers,
        }
    }

    pub fn queue(&self) -> SendQueue {
        self.queue.clone()
    }

    /// Close the queue and wait for queued packets to drain. Workers still
    /// busy after [`SHUTDOWN_GRACE`] are aborted.
    pub async fn shutdown(self) {
        self.queue.close();
        for mut worker in self.workers {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut worker).await.is_err() {
                debug!("Send worker still busy after shutdown grace, aborting");
                worker.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
