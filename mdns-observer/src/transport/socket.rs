use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use crate::config::TransportConfig;

/// The datagram operations the multiplexer needs from a socket.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }
}

/// Opens a fresh socket each time the multiplexer (re)opens.
pub trait SocketFactory: Send + Sync {
    fn open(&self) -> io::Result<Arc<dyn DatagramSocket>>;
}

/// Shared mDNS socket: bound to the group port with address reuse so other
/// responders on the host keep working, joined to the group.
pub struct MulticastSocketFactory {
    config: TransportConfig,
}

impl MulticastSocketFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

/// Windows does not allow binding to a multicast address
#[cfg(windows)]
fn bind_multicast(socket: &Socket, group: &SocketAddrV4) -> io::Result<()> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
    socket.bind(&SockAddr::from(addr))
}

#[cfg(unix)]
fn bind_multicast(socket: &Socket, group: &SocketAddrV4) -> io::Result<()> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
    socket.set_reuse_port(true)?;
    socket.bind(&SockAddr::from(addr))
}

impl SocketFactory for MulticastSocketFactory {
    fn open(&self) -> io::Result<Arc<dyn DatagramSocket>> {
        let group = self.config.group;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        bind_multicast(&socket, &group)?;
        socket.join_multicast_v4(group.ip(), &self.config.interface)?;
        socket.set_multicast_loop_v4(self.config.multicast_loop)?;
        if !self.config.interface.is_unspecified() {
            socket.set_multicast_if_v4(&self.config.interface)?;
        }
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        tracing::debug!("Bound multicast socket to {} via {}", group, self.config.interface);
        Ok(Arc::new(socket))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory socket for multiplexer and observer tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use parking_lot::Mutex;

    type Inbound = io::Result<(Vec<u8>, SocketAddr)>;

    #[derive(Default)]
    pub(crate) struct FakeNetwork {
        inbound: Mutex<Option<flume::Sender<Inbound>>>,
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
        opened: AtomicUsize,
        fail_open: Mutex<bool>,
    }

    impl FakeNetwork {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Deliver a datagram to the most recently opened socket
        pub(crate) fn inject(&self, bytes: Vec<u8>, from: SocketAddr) -> bool {
            match self.inbound.lock().as_ref() {
                Some(tx) => tx.send(Ok((bytes, from))).is_ok(),
                None => false,
            }
        }

        /// Make the current socket's pending receive fail
        pub(crate) fn fail(&self) {
            if let Some(tx) = self.inbound.lock().as_ref() {
                let _ = tx.send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "link down")));
            }
        }

        pub(crate) fn set_fail_open(&self, fail: bool) {
            *self.fail_open.lock() = fail;
        }

        pub(crate) fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub(crate) fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            self.sent.lock().clone()
        }
    }

    struct FakeSocket {
        network: Arc<FakeNetwork>,
        inbound: flume::Receiver<Inbound>,
    }

    #[async_trait]
    impl DatagramSocket for FakeSocket {
        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let (bytes, from) = self
                .inbound
                .recv_async()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "socket replaced"))??;
            let len = bytes.len().min(buf.len());
            buf[..len].copy_from_slice(&bytes[..len]);
            Ok((len, from))
        }

        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.network.sent.lock().push((buf.to_vec(), target));
            Ok(buf.len())
        }
    }

    pub(crate) struct FakeFactory(pub(crate) Arc<FakeNetwork>);

    impl SocketFactory for FakeFactory {
        fn open(&self) -> io::Result<Arc<dyn DatagramSocket>> {
            if *self.0.fail_open.lock() {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "port busy"));
            }
            let (tx, rx) = flume::unbounded();
            *self.0.inbound.lock() = Some(tx);
            self.0.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSocket {
                network: self.0.clone(),
                inbound: rx,
            }))
        }
    }
}
