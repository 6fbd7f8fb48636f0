//! Channel over one connected TCP socket.
//!
//! A `TcpChannel` owns its socket and two background tasks: a read task
//! (started by [`TcpChannel::start_receive`]) and a sequential writer task
//! shared by [`TcpChannel::send`] and [`TcpChannel::trigger_heart`].
//!
//! # Lifecycle
//!
//! ```text
//! OPEN ──close()──────────────────────────▶ CLOSED  (owner callback)
//!   └───read failure (unsolicited close)──▶ CLOSED  (owner callback, then disconnect listener)
//! ```
//!
//! The transition is one-way and guarded by a single atomic flag, so any
//! number of concurrent `close()` calls and read failures produce exactly one
//! teardown.

mod reader;
mod writer;

use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{LockResultExt, Result, TransportError};
use crate::observe::{CloseReason, SharedObserver, TransportEvent};

use reader::{ReadSettings, spawn_reader_task};
use writer::{OutboundWrite, spawn_heartbeat_task, spawn_writer_task};

/// Callback run once when the channel is torn down, used by the owning manager.
pub(crate) type OwnerCloseCallback = Box<dyn FnOnce() + Send>;

type DisconnectListener = Box<dyn FnOnce() + Send>;

/// Live wrapper over one connected socket.
///
/// Cloning is cheap; all clones refer to the same socket.
#[derive(Clone)]
pub struct TcpChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    /// Single source of truth for teardown
    closed: AtomicBool,
    /// Duplicate of the socket used to shut it down from any thread
    shutdown_handle: Mutex<Option<std::net::TcpStream>>,
    /// Read half, taken by the read task when receiving starts
    read_half: Mutex<Option<OwnedReadHalf>>,
    outbound: mpsc::UnboundedSender<OutboundWrite>,
    /// Stops the writer, heartbeat tickers, and reader
    cancel_token: CancellationToken,
    on_close: Mutex<Option<OwnerCloseCallback>>,
    disconnect_listener: Mutex<Option<DisconnectListener>>,
    runtime: Handle,
    observer: SharedObserver,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("local", &self.inner.local)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TcpChannel {
    /// Wrap a connected stream and start its writer task.
    ///
    /// `on_close` runs exactly once, on explicit close or unsolicited loss.
    /// Managers build channels under their registry lock, so nothing here
    /// reaches the observer; call [`TcpChannel::announce`] once the lock is
    /// released.
    pub(crate) fn new(
        stream: TcpStream,
        runtime: Handle,
        observer: SharedObserver,
        on_close: OwnerCloseCallback,
    ) -> std::io::Result<Self> {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();

        // Keep a duplicate descriptor so close() can shut the socket down
        // synchronously while the halves are owned by tasks.
        let std_stream = stream.into_std()?;
        let shutdown_handle = std_stream.try_clone()?;
        let stream = {
            let _guard = runtime.enter();
            TcpStream::from_std(std_stream)?
        };
        let (read_half, write_half) = stream.into_split();

        let cancel_token = CancellationToken::new();
        let (outbound, rx) = mpsc::unbounded_channel();
        spawn_writer_task(
            &runtime,
            write_half,
            rx,
            cancel_token.clone(),
            Arc::clone(&observer),
            peer,
        );

        Ok(Self {
            inner: Arc::new(ChannelInner {
                closed: AtomicBool::new(false),
                shutdown_handle: Mutex::new(Some(shutdown_handle)),
                read_half: Mutex::new(Some(read_half)),
                outbound,
                cancel_token,
                on_close: Mutex::new(Some(on_close)),
                disconnect_listener: Mutex::new(None),
                runtime,
                observer,
                peer,
                local,
            }),
        })
    }

    /// Start streaming received bytes to `on_receive`.
    ///
    /// Each callback gets the filled prefix of a `buffer_size` buffer.
    /// `read_timeout` is fixed for the life of the read task; `None` waits
    /// indefinitely. A zero-length read, an IO error, or an elapsed timeout
    /// closes the channel and fires the disconnect listener.
    pub fn start_receive<F>(
        &self,
        buffer_size: usize,
        read_timeout: Option<Duration>,
        on_receive: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        if buffer_size == 0 {
            return Err(TransportError::invalid_argument(
                "read buffer size must be positive",
            ));
        }
        if read_timeout == Some(Duration::ZERO) {
            return Err(TransportError::invalid_argument(
                "read timeout must be positive; use None to wait indefinitely",
            ));
        }
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }

        let read_half = self
            .inner
            .read_half
            .lock()
            .recover_poison("TcpChannel::start_receive")
            .take()
            .ok_or_else(|| {
                // Teardown drops the read half too
                if self.is_closed() {
                    TransportError::Disconnected
                } else {
                    TransportError::AlreadyReceiving
                }
            })?;

        let inner = Arc::clone(&self.inner);
        spawn_reader_task(
            &self.inner.runtime,
            read_half,
            ReadSettings {
                buffer_size,
                read_timeout,
            },
            self.inner.cancel_token.clone(),
            on_receive,
            move |error| {
                inner.teardown(CloseReason::Unsolicited(error.to_string()));
            },
        );
        Ok(())
    }

    /// Queue `bytes` for writing.
    ///
    /// `on_done` runs exactly once: `Ok(())` after the full buffer is written
    /// and flushed, or the write error. On a closed channel it runs
    /// synchronously with [`TransportError::Disconnected`].
    pub fn send<F>(&self, bytes: impl Into<Vec<u8>>, on_done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let write = OutboundWrite::Send {
            payload: bytes.into(),
            on_done: Box::new(on_done),
        };
        if self.is_closed() {
            write.reject();
            return;
        }
        if let Err(mpsc::error::SendError(write)) = self.inner.outbound.send(write) {
            write.reject();
        }
    }

    /// Write `payload` now and then every `interval` until the channel closes.
    ///
    /// Ticks share the writer queue with `send`. Failed ticks are reported to
    /// the observer only; the read path decides when the connection is lost.
    pub fn trigger_heart(&self, interval: Duration, payload: impl Into<Vec<u8>>) -> Result<()> {
        if interval.is_zero() {
            return Err(TransportError::invalid_argument(
                "heartbeat interval must be positive",
            ));
        }
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        let payload: Vec<u8> = payload.into();
        spawn_heartbeat_task(
            &self.inner.runtime,
            interval,
            Arc::from(payload),
            self.inner.outbound.clone(),
            self.inner.cancel_token.clone(),
        );
        Ok(())
    }

    /// Close the channel. Idempotent.
    ///
    /// Stops heartbeats, cancels the reader, shuts the socket down, and runs
    /// the owner callback once. Never fires the disconnect listener.
    pub fn close(&self) {
        self.inner.teardown(CloseReason::Explicit);
    }

    /// Register the listener for unsolicited connection loss.
    ///
    /// If the channel is already closed the listener runs immediately on the
    /// calling thread. Registering again replaces a listener that has not
    /// fired yet.
    pub fn set_on_disconnected_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self
            .inner
            .disconnect_listener
            .lock()
            .recover_poison("TcpChannel::set_on_disconnected_listener");
        if self.is_closed() {
            drop(slot);
            listener();
        } else {
            *slot = Some(Box::new(listener));
        }
    }

    /// Report the new channel to the observer.
    pub(crate) fn announce(&self) {
        self.inner.observer.on_event(&TransportEvent::ChannelOpened {
            peer: self.inner.peer,
            local: self.inner.local,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }
}

impl ChannelInner {
    /// Run teardown once. Returns whether this call performed it.
    fn teardown(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        // Stops heartbeat tickers and the writer, and unblocks a pending read
        self.cancel_token.cancel();
        self.shutdown_socket();
        self.read_half
            .lock()
            .recover_poison("ChannelInner::teardown")
            .take();

        let on_close = self
            .on_close
            .lock()
            .recover_poison("ChannelInner::teardown")
            .take();
        if let Some(on_close) = on_close {
            on_close();
        }

        let unsolicited = matches!(reason, CloseReason::Unsolicited(_));
        self.observer.on_event(&TransportEvent::ChannelClosed {
            peer: self.peer,
            reason,
        });

        if unsolicited {
            let listener = self
                .disconnect_listener
                .lock()
                .recover_poison("ChannelInner::teardown")
                .take();
            if let Some(listener) = listener {
                listener();
            }
        }
        true
    }

    fn shutdown_socket(&self) {
        let handle = self
            .shutdown_handle
            .lock()
            .recover_poison("ChannelInner::shutdown_socket")
            .take();
        let Some(socket) = handle else {
            return;
        };
        match socket.shutdown(Shutdown::Both) {
            Ok(()) => {}
            // Peer already reset the connection
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
            Err(e) => self.observer.on_event(&TransportEvent::SocketShutdownFailed {
                peer: self.peer,
                message: e.to_string(),
            }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::loopback_channel;
    use super::*;
    use crate::observe::default_observer;
    use crate::observe::test_support::RecordingObserver;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::{mpsc, oneshot};

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_reach_the_wire_in_submission_order() {
        let (channel, mut peer, _) = loopback_channel(default_observer()).await;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let mut expected = Vec::new();
        for i in 0..100 {
            let chunk = format!("msg-{};", i).into_bytes();
            expected.extend_from_slice(&chunk);
            let done_tx = done_tx.clone();
            channel.send(chunk, move |result| {
                let _ = done_tx.send(result.is_ok());
            });
        }

        let mut received = vec![0u8; expected.len()];
        tokio::time::timeout(WAIT, peer.read_exact(&mut received))
            .await
            .expect("should not timeout")
            .unwrap();
        assert_eq!(received, expected);

        for _ in 0..100 {
            assert_eq!(done_rx.recv().await, Some(true));
        }
    }

    #[tokio::test]
    async fn send_after_close_fails_synchronously() {
        let (channel, _peer, _) = loopback_channel(default_observer()).await;
        channel.close();

        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        channel.send(b"late".to_vec(), move |result| {
            *slot.lock().unwrap() = Some(result.map_err(|e| e.to_string()));
        });

        assert_eq!(
            *outcome.lock().unwrap(),
            Some(Err("socket is disconnected".to_string()))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_notifies_owner_once() {
        let (channel, mut peer, closes) = loopback_channel(default_observer()).await;

        channel.close();
        channel.close();
        channel.clone().close();

        assert!(channel.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // Peer observes the shutdown
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(WAIT, peer.read(&mut buf))
            .await
            .expect("should not timeout")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_close_tears_down_once() {
        let observer = Arc::new(RecordingObserver::default());
        let (channel, _peer, closes) = loopback_channel(observer.clone()).await;

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let channel = channel.clone();
                std::thread::spawn(move || channel.close())
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        let closed_events = observer
            .events()
            .into_iter()
            .filter(|e| matches!(e, TransportEvent::ChannelClosed { .. }))
            .count();
        assert_eq!(closed_events, 1);
    }

    #[tokio::test]
    async fn listener_on_closed_channel_fires_synchronously_once() {
        let (channel, _peer, _) = loopback_channel(default_observer()).await;
        channel.close();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        channel.set_on_disconnected_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn explicit_close_does_not_fire_disconnect_listener() {
        let (channel, _peer, _) = loopback_channel(default_observer()).await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        channel.set_on_disconnected_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.start_receive(64, None, |_| {}).unwrap();

        channel.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_close_runs_unsolicited_teardown() {
        let (channel, peer, closes) = loopback_channel(default_observer()).await;
        let (lost_tx, lost_rx) = oneshot::channel();
        channel.set_on_disconnected_listener(move || {
            let _ = lost_tx.send(());
        });
        channel.start_receive(64, None, |_| {}).unwrap();

        drop(peer);

        tokio::time::timeout(WAIT, lost_rx)
            .await
            .expect("should not timeout")
            .expect("listener should fire");
        assert!(channel.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // Explicit close afterwards is a no-op
        channel.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_timeout_is_a_connection_failure() {
        let observer = Arc::new(RecordingObserver::default());
        let (channel, _peer, _) = loopback_channel(observer.clone()).await;
        let (lost_tx, lost_rx) = oneshot::channel();
        channel.set_on_disconnected_listener(move || {
            let _ = lost_tx.send(());
        });

        channel
            .start_receive(64, Some(Duration::from_millis(30)), |_| {})
            .unwrap();

        tokio::time::timeout(WAIT, lost_rx)
            .await
            .expect("should not timeout")
            .expect("listener should fire");
        assert!(observer.events().iter().any(|e| matches!(
            e,
            TransportEvent::ChannelClosed {
                reason: CloseReason::Unsolicited(_),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn receive_delivers_exact_bytes() {
        let (channel, mut peer, _) = loopback_channel(default_observer()).await;
        let (data_tx, mut data_rx) = mpsc::unbounded_channel();
        channel
            .start_receive(1024, None, move |bytes| {
                let _ = data_tx.send(bytes.to_vec());
            })
            .unwrap();

        peer.write_all(b"ping").await.unwrap();

        let chunk = tokio::time::timeout(WAIT, data_rx.recv())
            .await
            .expect("should not timeout")
            .unwrap();
        assert_eq!(chunk, b"ping".to_vec());
        assert_eq!(chunk.len(), 4);
        channel.close();
    }

    #[tokio::test]
    async fn heartbeat_writes_payload_repeatedly() {
        let (channel, mut peer, _) = loopback_channel(default_observer()).await;
        channel
            .trigger_heart(Duration::from_millis(20), b"hb".to_vec())
            .unwrap();

        let mut received = [0u8; 6];
        tokio::time::timeout(WAIT, peer.read_exact(&mut received))
            .await
            .expect("should not timeout")
            .unwrap();
        assert_eq!(&received, b"hbhbhb");
        channel.close();
    }

    #[tokio::test]
    async fn start_receive_rejects_second_call() {
        let (channel, _peer, _) = loopback_channel(default_observer()).await;
        channel.start_receive(16, None, |_| {}).unwrap();

        let second = channel.start_receive(16, None, |_| {});
        assert!(matches!(second, Err(TransportError::AlreadyReceiving)));
        channel.close();
    }

    #[tokio::test]
    async fn trigger_heart_validates_arguments_and_state() {
        let (channel, _peer, _) = loopback_channel(default_observer()).await;

        let zero = channel.trigger_heart(Duration::ZERO, b"hb".to_vec());
        assert!(matches!(zero, Err(TransportError::InvalidArgument(_))));

        channel.close();
        let closed = channel.trigger_heart(Duration::from_millis(10), b"hb".to_vec());
        assert!(matches!(closed, Err(TransportError::Disconnected)));
    }
}
