//! Shared multicast transport.
//!
//! One OS socket is shared by every [`Handle`] created from the same
//! [`Transport`]. The socket is opened when the first subscription appears
//! and closed when the last one is dropped. Sends issued while a close is in
//! flight are queued and replayed through the next socket before it starts
//! serving subscribers.

pub mod socket;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use hickory_proto::op::Message;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use crate::config::TransportConfig;
use crate::dns;
use crate::error::Result;
use self::socket::{DatagramSocket, MulticastSocketFactory, SocketFactory};

/// Large enough for jumbo-frame mDNS packets
const RECV_BUFFER_SIZE: usize = 9000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Every datagram as received
    Raw,
    /// Datagrams that decode as DNS messages
    Decoded,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Raw {
        bytes: Arc<[u8]>,
        from: SocketAddr,
    },
    Decoded {
        message: Arc<Message>,
        from: SocketAddr,
    },
    /// The socket closed; the transport reopens on its own while
    /// subscriptions remain
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Encoded size exceeds the configured maximum; nothing was sent
    Rejected { size: usize, max: usize },
    /// Socket is closing; the datagram goes out through the next socket
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Open,
    Closing,
}

enum State {
    Closed,
    Open {
        socket: Arc<dyn DatagramSocket>,
        cancel: CancellationToken,
    },
    Closing,
}

struct Subscriber {
    id: u64,
    kind: MessageKind,
    tx: flume::Sender<TransportEvent>,
}

struct Inner {
    state: State,
    subscribers: Vec<Subscriber>,
    queue: VecDeque<(Vec<u8>, SocketAddr)>,
    next_id: u64,
}

impl Inner {
    fn wants_decoded(&self) -> bool {
        self.subscribers.iter().any(|s| s.kind == MessageKind::Decoded)
    }

    fn broadcast(&self, kind: MessageKind, event: &TransportEvent) {
        for subscriber in self.subscribers.iter().filter(|s| s.kind == kind) {
            let _ = subscriber.tx.send(event.clone());
        }
    }
}

struct Shared {
    config: TransportConfig,
    factory: Box<dyn SocketFactory>,
    inner: Mutex<Inner>,
    closed_tx: broadcast::Sender<()>,
}

/// Process-wide multicast socket resource. Cloning is cheap and every clone
/// refers to the same socket.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let factory = MulticastSocketFactory::new(config.clone());
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: TransportConfig, factory: impl SocketFactory + 'static) -> Self {
        let (closed_tx, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                config,
                factory: Box::new(factory),
                inner: Mutex::new(Inner {
                    state: State::Closed,
                    subscribers: Vec::new(),
                    queue: VecDeque::new(),
                    next_id: 0,
                }),
                closed_tx,
            }),
        }
    }

    pub fn open(&self) -> Handle {
        Handle { transport: self.clone() }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SocketState {
        match self.shared.inner.lock().state {
            State::Closed => SocketState::Closed,
            State::Open { .. } => SocketState::Open,
            State::Closing => SocketState::Closing,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.inner.lock().subscribers.len()
    }

    fn subscribe(&self, kind: MessageKind) -> Subscription {
        let (tx, rx) = flume::unbounded();
        let mut inner = self.shared.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, kind, tx });

        // while closing, the reopen happens once the old socket is gone
        if matches!(inner.state, State::Closed) {
            match self.shared.factory.open() {
                Ok(socket) => self.activate(&mut inner, socket),
                Err(e) => {
                    tracing::error!("Failed to open multicast socket: {}", e);
                    self.notify_closed(&inner);
                }
            }
        }

        Subscription {
            id,
            kind,
            rx,
            transport: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.shared.inner.lock();
        inner.subscribers.retain(|s| s.id != id);

        if !inner.subscribers.is_empty() {
            return;
        }
        let cancel = match &inner.state {
            State::Open { cancel, .. } => cancel.clone(),
            _ => return,
        };
        tracing::debug!("Last subscriber gone, closing multicast socket");
        cancel.cancel();
        inner.state = State::Closing;
    }

    /// Start serving subscribers from `socket`. Caller holds the lock.
    fn activate(&self, inner: &mut Inner, socket: Arc<dyn DatagramSocket>) {
        let cancel = CancellationToken::new();
        inner.state = State::Open {
            socket: socket.clone(),
            cancel: cancel.clone(),
        };
        tracing::info!("Multicast socket open on {}", self.shared.config.group);
        tokio::spawn(read_loop(self.clone(), socket, cancel));
    }

    fn notify_closed(&self, inner: &Inner) {
        for subscriber in &inner.subscribers {
            let _ = subscriber.tx.send(TransportEvent::Closed);
        }
        let _ = self.shared.closed_tx.send(());
    }

    fn deliver(&self, bytes: &[u8], from: SocketAddr) {
        let inner = self.shared.inner.lock();
        let bytes: Arc<[u8]> = Arc::from(bytes);

        inner.broadcast(MessageKind::Raw, &TransportEvent::Raw { bytes: bytes.clone(), from });

        if !inner.wants_decoded() {
            return;
        }
        match dns::decode(&bytes) {
            Some(message) => inner.broadcast(
                MessageKind::Decoded,
                &TransportEvent::Decoded { message: Arc::new(message), from },
            ),
            None => tracing::trace!("Dropping undecodable packet from {}", from),
        }
    }

    /// Runs on the reader task once the socket is gone: notify, replay the
    /// send queue, then reopen if anyone is still subscribed.
    async fn finish_close(&self, failure: Option<std::io::Error>) {
        {
            let inner = self.shared.inner.lock();
            match &failure {
                Some(e) => tracing::warn!("Multicast socket failed: {}", e),
                None => tracing::info!("Multicast socket closed"),
            }
            self.notify_closed(&inner);
        }

        let mut replacement: Option<Arc<dyn DatagramSocket>> = None;

        loop {
            let batch: Vec<(Vec<u8>, SocketAddr)> = {
                let mut inner = self.shared.inner.lock();
                if inner.queue.is_empty() {
                    if inner.subscribers.is_empty() {
                        inner.state = State::Closed;
                        return;
                    }
                    let socket = match replacement.take() {
                        Some(socket) => Ok(socket),
                        None => self.shared.factory.open(),
                    };
                    match socket {
                        Ok(socket) => self.activate(&mut inner, socket),
                        Err(e) => {
                            tracing::error!("Failed to reopen multicast socket: {}", e);
                            inner.state = State::Closed;
                            self.notify_closed(&inner);
                        }
                    }
                    return;
                }
                inner.queue.drain(..).collect()
            };

            let socket = match replacement.take() {
                Some(socket) => socket,
                None => match self.shared.factory.open() {
                    Ok(socket) => socket,
                    Err(e) => {
                        tracing::error!("Dropping {} queued packets, cannot open socket: {}", batch.len(), e);
                        continue;
                    }
                },
            };

            tracing::debug!("Replaying {} queued packets", batch.len());
            for (bytes, target) in &batch {
                if let Err(e) = socket.send_to(bytes, *target).await {
                    tracing::warn!("Failed to send queued packet to {}: {}", target, e);
                }
            }
            replacement = Some(socket);
        }
    }
}

async fn read_loop(transport: Transport, socket: Arc<dyn DatagramSocket>, cancel: CancellationToken) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    let failure = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => transport.deliver(&buf[..len], from),
                Err(e) => break Some(e),
            }
        }
    };

    drop(socket);
    if failure.is_some() {
        // a failed socket is not closing on request; mark it so sends queue
        let mut inner = transport.shared.inner.lock();
        if matches!(inner.state, State::Open { .. }) {
            inner.state = State::Closing;
        }
    }
    transport.finish_close(failure).await;
}

/// Per-consumer view of the shared transport.
#[derive(Clone)]
pub struct Handle {
    transport: Transport,
}

impl Handle {
    pub fn subscribe(&self, kind: MessageKind) -> Subscription {
        self.transport.subscribe(kind)
    }

    /// Encode and send `message` to `dest`, or to the multicast group.
    pub async fn send(&self, message: &Message, dest: Option<SocketAddr>) -> Result<SendOutcome> {
        let bytes = dns::encode(message)?;
        let config = &self.transport.shared.config;
        if bytes.len() > config.max_packet_size {
            tracing::warn!(
                "Refusing to send {} byte message, limit is {}",
                bytes.len(),
                config.max_packet_size
            );
            return Ok(SendOutcome::Rejected {
                size: bytes.len(),
                max: config.max_packet_size,
            });
        }
        let target = dest.unwrap_or_else(|| config.group_addr());

        let socket = {
            let mut inner = self.transport.shared.inner.lock();
            if matches!(inner.state, State::Closing) {
                inner.queue.push_back((bytes, target));
                return Ok(SendOutcome::Queued);
            }
            match &inner.state {
                State::Open { socket, .. } => Some(socket.clone()),
                _ => None,
            }
        };

        // nobody is subscribed: use a socket just for this datagram
        let socket = match socket {
            Some(socket) => socket,
            None => self.transport.shared.factory.open()?,
        };
        socket.send_to(&bytes, target).await?;
        Ok(SendOutcome::Sent)
    }

    /// Fires every time the shared socket closes, for any reason.
    pub fn closed(&self) -> broadcast::Receiver<()> {
        self.transport.shared.closed_tx.subscribe()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

/// Receives transport events until dropped; dropping unsubscribes.
pub struct Subscription {
    id: u64,
    kind: MessageKind,
    rx: flume::Receiver<TransportEvent>,
    transport: Transport,
}

impl Subscription {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub async fn recv(&self) -> Option<TransportEvent> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::fixtures::{peer, Packet};
    use super::socket::fake::{FakeFactory, FakeNetwork};

    fn transport(network: &Arc<FakeNetwork>) -> Transport {
        Transport::with_factory(TransportConfig::default(), FakeFactory(network.clone()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_follows_subscriptions() {
        let network = FakeNetwork::new();
        let transport = transport(&network);
        let handle = transport.open();
        assert_eq!(transport.state(), SocketState::Closed);
        assert_eq!(network.opened(), 0);

        let first = handle.subscribe(MessageKind::Raw);
        let second = transport.open().subscribe(MessageKind::Decoded);
        assert_eq!(transport.state(), SocketState::Open);
        assert_eq!(network.opened(), 1);

        drop(first);
        assert_eq!(transport.state(), SocketState::Open);

        drop(second);
        assert_eq!(transport.state(), SocketState::Closing);
        settle().await;
        assert_eq!(transport.state(), SocketState::Closed);
        assert_eq!(network.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_and_decoded_delivery() {
        let network = FakeNetwork::new();
        let transport = transport(&network);
        let raw = transport.open().subscribe(MessageKind::Raw);
        let decoded = transport.open().subscribe(MessageKind::Decoded);

        let packet = Packet::response().a("host.local", 120, "10.0.0.7").bytes();
        assert!(network.inject(packet.clone(), peer()));
        assert!(network.inject(vec![1, 2, 3], peer()));
        settle().await;

        match raw.try_recv() {
            Some(TransportEvent::Raw { bytes, from }) => {
                assert_eq!(&bytes[..], &packet[..]);
                assert_eq!(from, peer());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(raw.try_recv(), Some(TransportEvent::Raw { bytes, .. }) if bytes.len() == 3));

        match decoded.try_recv() {
            Some(TransportEvent::Decoded { message, .. }) => assert_eq!(message.answers().len(), 1),
            other => panic!("unexpected event: {other:?}"),
        }
        // the garbage datagram produced no decoded event
        assert!(decoded.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rejects_oversized_message() {
        let network = FakeNetwork::new();
        let config = TransportConfig {
            max_packet_size: 40,
            ..TransportConfig::default()
        };
        let transport = Transport::with_factory(config, FakeFactory(network.clone()));
        let handle = transport.open();
        let _sub = handle.subscribe(MessageKind::Raw);

        let message = dns::decode(
            &Packet::response()
                .srv("a-rather-long-instance-name._http._tcp.local", 120, "host.local", 80)
                .bytes(),
        )
        .unwrap();
        let outcome = handle.send(&message, None).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Rejected { max: 40, .. }));
        assert!(network.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_goes_to_group_by_default() {
        let network = FakeNetwork::new();
        let transport = transport(&network);
        let handle = transport.open();
        let _sub = handle.subscribe(MessageKind::Raw);

        let query = dns::ptr_query("_http._tcp.local").unwrap();
        assert_eq!(handle.send(&query, None).await.unwrap(), SendOutcome::Sent);
        let direct: SocketAddr = "10.0.0.9:5353".parse().unwrap();
        assert_eq!(handle.send(&query, Some(direct)).await.unwrap(), SendOutcome::Sent);

        let sent = network.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, transport.config().group_addr());
        assert_eq!(sent[1].1, direct);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_subscribers_uses_transient_socket() {
        let network = FakeNetwork::new();
        let transport = transport(&network);
        let query = dns::ptr_query("_ipp._tcp.local").unwrap();

        assert_eq!(transport.open().send(&query, None).await.unwrap(), SendOutcome::Sent);
        assert_eq!(network.sent().len(), 1);
        assert_eq!(transport.state(), SocketState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_during_close_is_replayed_on_reopen() {
        let network = FakeNetwork::new();
        let transport = transport(&network);
        let handle = transport.open();
        let mut closed = handle.closed();

        let sub = handle.subscribe(MessageKind::Raw);
        drop(sub);
        assert_eq!(transport.state(), SocketState::Closing);

        let query = dns::ptr_query("_http._tcp.local").unwrap();
        assert_eq!(handle.send(&query, None).await.unwrap(), SendOutcome::Queued);

        // resubscribing while closing must not open a second socket early
        let sub = handle.subscribe(MessageKind::Raw);
        assert_eq!(network.opened(), 1);

        settle().await;
        assert!(closed.try_recv().is_ok());
        assert_eq!(transport.state(), SocketState::Open);
        assert_eq!(network.opened(), 2);
        assert_eq!(network.sent().len(), 1);

        // the replacement socket serves the subscriber
        assert!(matches!(sub.try_recv(), Some(TransportEvent::Closed)));
        network.inject(Packet::response().a("h.local", 1, "10.0.0.1").bytes(), peer());
        settle().await;
        assert!(matches!(sub.try_recv(), Some(TransportEvent::Raw { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_send_without_subscribers_closes_again() {
        let network = FakeNetwork::new();
        let transport = transport(&network);
        let handle = transport.open();

        drop(handle.subscribe(MessageKind::Raw));
        let query = dns::ptr_query("_http._tcp.local").unwrap();
        assert_eq!(handle.send(&query, None).await.unwrap(), SendOutcome::Queued);

        settle().await;
        assert_eq!(network.sent().len(), 1);
        assert_eq!(transport.state(), SocketState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_error_notifies_and_reopens() {
        let network = FakeNetwork::new();
        let transport = transport(&network);
        let sub = transport.open().subscribe(MessageKind::Raw);

        network.fail();
        settle().await;

        assert!(matches!(sub.try_recv(), Some(TransportEvent::Closed)));
        assert_eq!(transport.state(), SocketState::Open);
        assert_eq!(network.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_reports_closed() {
        let network = FakeNetwork::new();
        network.set_fail_open(true);
        let transport = transport(&network);
        let sub = transport.open().subscribe(MessageKind::Raw);

        assert!(matches!(sub.try_recv(), Some(TransportEvent::Closed)));
        assert_eq!(transport.state(), SocketState::Closed);
    }
}
