//! Inbound listener manager.
//!
//! `Listener::bind` returns a [`ListenerId`] immediately. One background task
//! per handle binds the listening socket, reports the port, and accepts
//! peers until it is unbound or the socket fails. Each accepted peer becomes
//! a [`TcpChannel`] recorded under its `"ip:port"` key.
//!
//! As in the connector, the registry decides every race: a peer accepted
//! after `unbind` is closed without a callback, and a socket failure after
//! `unbind` is not reported. Deliveries of `Bound` and of accepted peers hold
//! the record's [`DeliveryGate`], so `unbind` returns only after any such
//! callback already under way has finished.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::channel::{OwnerCloseCallback, TcpChannel};
use crate::error::{Result, TransportError};
use crate::handle::ListenerId;
use crate::observe::{SharedObserver, TransportEvent, default_observer};
use crate::registry::{DeliveryGate, Registry};

/// Default bind address: ephemeral port on all IPv4 interfaces.
///
/// IPv6 peers are not accepted on this address. Use
/// [`Listener::with_bind_address`] with `[::]:0` for an IPv6 (or, where the
/// OS allows it, dual-stack) listener.
pub const DEFAULT_BIND_ADDRESS: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Outcome reported through `bind`'s `on_bind` callback.
#[derive(Debug)]
pub enum BindEvent {
    /// The listening socket is open on this port
    Bound(u16),
    /// Binding or accepting failed while the handle was still registered
    Failed(TransportError),
}

struct ListenerRecord {
    /// Stops the bind/accept task
    cancel: CancellationToken,
    /// Known once the socket is bound
    port: Option<u16>,
    /// Established peers keyed by `"ip:port"`
    peers: HashMap<String, PeerEntry>,
    /// Serial handed to the next accepted peer
    next_serial: u64,
    delivery: Arc<DeliveryGate>,
}

impl ListenerRecord {
    fn new(cancel: CancellationToken, delivery: Arc<DeliveryGate>) -> Self {
        Self {
            cancel,
            port: None,
            peers: HashMap::new(),
            next_serial: 0,
            delivery,
        }
    }

    fn close_peers(self) {
        for peer in self.peers.into_values() {
            peer.channel.close();
        }
    }
}

/// One accepted peer. The serial tells apart two channels that reused the
/// same `"ip:port"` key.
struct PeerEntry {
    serial: u64,
    channel: TcpChannel,
}

/// Binds listening sockets and tracks their peers by handle.
///
/// Cloning shares the same registry. Dropping the listener does not tear
/// anything down; call [`Listener::unbind_all`] for that.
#[derive(Clone)]
pub struct Listener {
    registry: Arc<Registry<ListenerId, ListenerRecord>>,
    runtime: Handle,
    observer: SharedObserver,
    bind_address: SocketAddr,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("bind_address", &self.bind_address)
            .field("active", &self.registry.len())
            .finish()
    }
}

/// Key under which a peer is recorded and reported.
pub fn address_key(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

impl Listener {
    /// Create a listener that runs its tasks on the current tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime =
            Handle::try_current().map_err(|e| TransportError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(runtime))
    }

    /// Create a listener that runs its tasks on `runtime`.
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            runtime,
            observer: default_observer(),
            bind_address: DEFAULT_BIND_ADDRESS,
        }
    }

    /// Replace the observer that receives events without a caller callback.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Bind future listening sockets to `address` instead of `0.0.0.0:0`.
    pub fn with_bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Start listening.
    ///
    /// `on_bind` receives `Bound(port)` once the socket is open, and
    /// `Failed(error)` if binding or accepting fails while the handle is
    /// still registered. `on_client_connect` runs for every accepted peer.
    pub fn bind<B, C>(&self, on_bind: B, on_client_connect: C) -> ListenerId
    where
        B: FnMut(BindEvent) + Send + 'static,
        C: FnMut(String, TcpChannel) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let delivery = Arc::new(DeliveryGate::default());
        let id = self
            .registry
            .insert(ListenerRecord::new(cancel.clone(), Arc::clone(&delivery)));

        let this = self.clone();
        self.runtime.spawn(async move {
            this.run(id, cancel, delivery, on_bind, on_client_connect)
                .await
        });
        id
    }

    /// Stop listening on `handle` and close every peer it accepted.
    ///
    /// Returns whether `handle` was still registered. After `true`, no
    /// callback fires for this handle. If `Bound` or a new peer is being
    /// delivered on another thread, this waits for that callback to return.
    pub fn unbind(&self, handle: ListenerId) -> bool {
        let Some(record) = self.registry.remove(handle) else {
            return false;
        };
        log::debug!(
            target: "tcpcom::listener",
            "Unbinding {} with {} peer(s)",
            handle,
            record.peers.len()
        );

        record.delivery.wait_idle();
        // The accept loop drops the listening socket when it sees this
        record.cancel.cancel();
        record.close_peers();
        true
    }

    /// Unbind every handle known at the time of the call.
    pub fn unbind_all(&self) {
        for handle in self.registry.ids() {
            self.unbind(handle);
        }
    }

    /// Port the listening socket for `handle` is bound to, once known.
    pub fn local_port(&self, handle: ListenerId) -> Option<u16> {
        self.registry
            .with_record(handle, |record| record.port)
            .flatten()
    }

    /// Number of live peers accepted on `handle`.
    pub fn peer_count(&self, handle: ListenerId) -> usize {
        self.registry
            .with_record(handle, |record| record.peers.len())
            .unwrap_or(0)
    }

    pub fn is_bound(&self, handle: ListenerId) -> bool {
        self.registry.contains(handle)
    }

    /// Number of registered listener handles.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn run<B, C>(
        self,
        id: ListenerId,
        cancel: CancellationToken,
        delivery: Arc<DeliveryGate>,
        mut on_bind: B,
        mut on_client_connect: C,
    ) where
        B: FnMut(BindEvent) + Send + 'static,
        C: FnMut(String, TcpChannel) + Send + 'static,
    {
        let bound = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            bound = TcpListener::bind(self.bind_address) => bound,
        };
        let (socket, port) = match bound.and_then(|socket| {
            let port = socket.local_addr()?.port();
            Ok((socket, port))
        }) {
            Ok(bound) => bound,
            Err(e) => return self.stop(id, TransportError::Bind(e), &mut on_bind),
        };

        {
            let _delivering = delivery.enter();
            if self
                .registry
                .with_record(id, |record| record.port = Some(port))
                .is_none()
            {
                // Unbound while binding; the socket closes on return
                return;
            }
            log::info!(target: "tcpcom::listener", "Listener {} bound on port {}", id, port);
            on_bind(BindEvent::Bound(port));
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!(target: "tcpcom::listener", "Listener {} cancelled", id);
                    return;
                }
                accepted = socket.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    self.admit(id, &delivery, stream, addr, &mut on_client_connect)
                }
                Err(e) => return self.stop(id, TransportError::Bind(e), &mut on_bind),
            }
        }
    }

    /// Record an accepted peer if the handle is still owned.
    fn admit<C>(
        &self,
        id: ListenerId,
        delivery: &DeliveryGate,
        stream: TcpStream,
        addr: SocketAddr,
        on_client_connect: &mut C,
    ) where
        C: FnMut(String, TcpChannel),
    {
        let key = address_key(&addr);
        let registry = Arc::downgrade(&self.registry);
        let _delivering = delivery.enter();

        let admitted = self.registry.with_record(id, |record| {
            let serial = record.next_serial;
            let channel = TcpChannel::new(
                stream,
                self.runtime.clone(),
                Arc::clone(&self.observer),
                release_peer_on_close(registry, id, key.clone(), serial),
            )?;
            record.next_serial += 1;
            let displaced = record.peers.insert(
                key.clone(),
                PeerEntry {
                    serial,
                    channel: channel.clone(),
                },
            );
            Ok::<_, std::io::Error>((channel, displaced))
        });

        match admitted {
            Some(Ok((channel, displaced))) => {
                if let Some(stale) = displaced {
                    log::debug!(
                        target: "tcpcom::listener",
                        "Listener {} replacing stale peer {}",
                        id,
                        key
                    );
                    stale.channel.close();
                }
                channel.announce();
                // The observer may have unbound this handle
                if !self.registry.contains(id) {
                    self.observer.on_event(&TransportEvent::PeerDiscarded {
                        id,
                        peer: Some(addr),
                    });
                    return;
                }
                log::debug!(target: "tcpcom::listener", "Listener {} accepted {}", id, key);
                on_client_connect(key, channel);
            }
            Some(Err(e)) => log::warn!(
                target: "tcpcom::listener",
                "Listener {} could not set up channel for {}: {}",
                id,
                key,
                e
            ),
            None => self.observer.on_event(&TransportEvent::PeerDiscarded {
                id,
                peer: Some(addr),
            }),
        }
    }

    /// End the loop, reporting `error` only if this call removes the handle.
    fn stop<B>(&self, id: ListenerId, error: TransportError, on_bind: &mut B)
    where
        B: FnMut(BindEvent),
    {
        let message = error.to_string();
        let reported = match self.registry.remove(id) {
            Some(record) => {
                record.close_peers();
                on_bind(BindEvent::Failed(error));
                true
            }
            None => false,
        };
        self.observer.on_event(&TransportEvent::AcceptLoopEnded {
            id,
            message,
            reported,
        });
    }
}

/// Owner callback that drops only this peer's entry from the listener record.
///
/// An entry that has since been replaced under the same key is left alone.
fn release_peer_on_close(
    registry: Weak<Registry<ListenerId, ListenerRecord>>,
    id: ListenerId,
    key: String,
    serial: u64,
) -> OwnerCloseCallback {
    Box::new(move || {
        if let Some(registry) = registry.upgrade() {
            // The removed channel is dropped after the lock is released
            let removed = registry.with_record(id, |record| {
                let current = record.peers.get(&key).map(|entry| entry.serial);
                if current == Some(serial) {
                    record.peers.remove(&key)
                } else {
                    None
                }
            });
            if let Some(Some(_)) = removed {
                log::debug!(target: "tcpcom::listener", "Peer {} on listener {} closed", key, id);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::TransportObserver;
    use crate::observe::test_support::RecordingObserver;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    fn loopback_listener(observer: SharedObserver) -> Listener {
        Listener::new()
            .unwrap()
            .with_observer(observer)
            .with_bind_address("127.0.0.1:0".parse().unwrap())
    }

    fn bind_events(
        listener: &Listener,
    ) -> (
        ListenerId,
        mpsc::UnboundedReceiver<BindEvent>,
        mpsc::UnboundedReceiver<(String, TcpChannel)>,
    ) {
        let (bind_tx, bind_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let id = listener.bind(
            move |event| {
                let _ = bind_tx.send(event);
            },
            move |key, channel| {
                let _ = peer_tx.send((key, channel));
            },
        );
        (id, bind_rx, peer_rx)
    }

    async fn bound_port(rx: &mut mpsc::UnboundedReceiver<BindEvent>) -> u16 {
        match tokio::time::timeout(WAIT, rx.recv()).await {
            Ok(Some(BindEvent::Bound(port))) => port,
            other => panic!("expected Bound, got {:?}", other),
        }
    }

    /// Connect to `socket` and return the client with the accepted side.
    async fn accepted_pair(socket: &TcpListener) -> (TcpStream, TcpStream, SocketAddr) {
        let addr = socket.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), socket.accept());
        let (stream, peer) = accepted.unwrap();
        (client.unwrap(), stream, peer)
    }

    #[test]
    fn address_key_has_no_brackets() {
        let v4: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let v6: SocketAddr = "[::1]:5000".parse().unwrap();
        assert_eq!(address_key(&v4), "127.0.0.1:5000");
        assert_eq!(address_key(&v6), "::1:5000");
    }

    #[test]
    fn new_requires_a_runtime() {
        assert!(matches!(Listener::new(), Err(TransportError::NoRuntime(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_reports_port_and_accepts_peers() {
        let listener = loopback_listener(default_observer());
        let (id, mut bind_rx, mut peer_rx) = bind_events(&listener);

        let port = bound_port(&mut bind_rx).await;
        assert_ne!(port, 0);
        assert_eq!(listener.local_port(id), Some(port));

        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (key, channel) = tokio::time::timeout(WAIT, peer_rx.recv())
            .await
            .expect("should not timeout")
            .unwrap();

        assert_eq!(key, address_key(&client.local_addr().unwrap()));
        assert_eq!(channel.peer_addr(), client.local_addr().ok());
        assert_eq!(listener.peer_count(id), 1);
        listener.unbind_all();
    }

    #[tokio::test]
    async fn bind_returns_handle_before_socket_opens() {
        let listener = loopback_listener(default_observer());
        let (id, _bind_rx, _peer_rx) = bind_events(&listener);

        // Current-thread runtime: the bind task has not run yet
        assert!(listener.is_bound(id));
        assert_eq!(listener.local_port(id), None);
        assert!(listener.unbind(id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unbind_while_accepting_reports_nothing() {
        let observer = Arc::new(RecordingObserver::default());
        let listener = loopback_listener(observer.clone());
        let (id, mut bind_rx, _peer_rx) = bind_events(&listener);
        let port = bound_port(&mut bind_rx).await;

        assert!(listener.unbind(id));
        assert!(!listener.unbind(id));

        // The listening socket goes away once the loop sees the cancel
        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused, "listening socket should be closed after unbind");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bind_rx.try_recv().is_err(), "no Failed after unbind");
        assert!(
            !observer
                .events()
                .iter()
                .any(|e| matches!(e, TransportEvent::AcceptLoopEnded { reported: true, .. }))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unbind_closes_accepted_peers() {
        let listener = loopback_listener(default_observer());
        let (id, mut bind_rx, mut peer_rx) = bind_events(&listener);
        let port = bound_port(&mut bind_rx).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (_key, channel) = tokio::time::timeout(WAIT, peer_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(listener.unbind(id));
        assert!(channel.is_closed());

        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(WAIT, client.read(&mut buf))
            .await
            .expect("should not timeout")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_close_removes_only_that_peer() {
        let listener = loopback_listener(default_observer());
        let (id, mut bind_rx, mut peer_rx) = bind_events(&listener);
        let port = bound_port(&mut bind_rx).await;

        let first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut channels = HashMap::new();
        for _ in 0..2 {
            let (key, channel) = tokio::time::timeout(WAIT, peer_rx.recv())
                .await
                .unwrap()
                .unwrap();
            channels.insert(key, channel);
        }
        assert_eq!(listener.peer_count(id), 2);

        let first_key = address_key(&first.local_addr().unwrap());
        let first_channel = channels.remove(&first_key).unwrap();
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        first_channel.set_on_disconnected_listener(move || {
            let _ = lost_tx.send(());
        });
        first_channel.start_receive(64, None, |_| {}).unwrap();
        drop(first);

        tokio::time::timeout(WAIT, lost_rx.recv())
            .await
            .expect("peer loss should fire the listener")
            .unwrap();
        assert!(listener.is_bound(id));
        assert_eq!(listener.peer_count(id), 1);
        listener.unbind(id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_accepted_after_unbind_is_discarded() {
        let observer = Arc::new(RecordingObserver::default());
        let listener = loopback_listener(observer.clone());
        let gate = Arc::new(DeliveryGate::default());
        let id = listener
            .registry
            .insert(ListenerRecord::new(CancellationToken::new(), Arc::clone(&gate)));
        assert!(listener.unbind(id));

        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, stream, peer) = accepted_pair(&socket).await;

        let mut calls = 0;
        listener.admit(id, &gate, stream, peer, &mut |_: String, _: TcpChannel| {
            calls += 1
        });

        assert_eq!(calls, 0);
        assert_eq!(
            observer.events(),
            vec![TransportEvent::PeerDiscarded {
                id,
                peer: Some(peer)
            }]
        );
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(WAIT, client.read(&mut buf))
            .await
            .expect("should not timeout")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    /// An observer that unbinds on `ChannelOpened` keeps the peer from
    /// reaching `on_client_connect`.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unbind_from_channel_opened_suppresses_peer() {
        let target: Arc<std::sync::Mutex<Option<(Listener, ListenerId)>>> = Arc::default();
        let removed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let recorder = Arc::new(RecordingObserver::default());

        let observer: SharedObserver = {
            let target = Arc::clone(&target);
            let removed = Arc::clone(&removed);
            let recorder = Arc::clone(&recorder);
            Arc::new(move |event: &TransportEvent| {
                recorder.on_event(event);
                if matches!(event, TransportEvent::ChannelOpened { .. }) {
                    let current = target.lock().unwrap().clone();
                    if let Some((listener, id)) = current
                        && listener.unbind(id)
                    {
                        removed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                }
            })
        };
        let listener = loopback_listener(observer);
        let (id, mut bind_rx, mut peer_rx) = bind_events(&listener);
        let port = bound_port(&mut bind_rx).await;
        *target.lock().unwrap() = Some((listener.clone(), id));

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let peer = client.local_addr().unwrap();
        for _ in 0..100 {
            if removed.load(std::sync::atomic::Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(removed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(peer_rx.try_recv().is_err(), "no peer after unbind");
        assert!(listener.is_empty());
        assert!(recorder.events().contains(&TransportEvent::PeerDiscarded {
            id,
            peer: Some(peer)
        }));
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(WAIT, client.read(&mut buf))
            .await
            .expect("should not timeout")
            .unwrap_or(0);
        assert_eq!(n, 0);
        target.lock().unwrap().take();
    }

    /// A second peer under an existing key closes the first, and the first
    /// one's close leaves the new entry in place.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reused_peer_key_replaces_stale_channel() {
        let listener = loopback_listener(default_observer());
        let gate = Arc::new(DeliveryGate::default());
        let id = listener
            .registry
            .insert(ListenerRecord::new(CancellationToken::new(), Arc::clone(&gate)));

        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut first_client, first_stream, peer) = accepted_pair(&socket).await;
        let (_second_client, second_stream, _) = accepted_pair(&socket).await;

        let mut channels = Vec::new();
        let mut collect = |key: String, channel: TcpChannel| channels.push((key, channel));
        listener.admit(id, &gate, first_stream, peer, &mut collect);
        listener.admit(id, &gate, second_stream, peer, &mut collect);

        assert_eq!(channels.len(), 2);
        let (first, second) = (&channels[0].1, &channels[1].1);
        assert!(first.is_closed(), "displaced channel should be closed");
        assert!(!second.is_closed());
        assert_eq!(listener.peer_count(id), 1);

        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(WAIT, first_client.read(&mut buf))
            .await
            .expect("should not timeout")
            .unwrap_or(0);
        assert_eq!(n, 0);

        second.close();
        assert_eq!(listener.peer_count(id), 0);
        assert!(listener.unbind(id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_failure_is_reported_while_registered() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = occupied.local_addr().unwrap();
        let listener = Listener::new().unwrap().with_bind_address(taken);
        let (id, mut bind_rx, _peer_rx) = bind_events(&listener);

        match tokio::time::timeout(WAIT, bind_rx.recv()).await {
            Ok(Some(BindEvent::Failed(error))) => {
                assert!(matches!(error, TransportError::Bind(_)));
                assert!(!error.to_string().is_empty());
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(!listener.is_bound(id));
        assert!(!listener.unbind(id));
    }
}
