//! Outbound connection manager.
//!
//! `Connector::connect` returns a [`ConnectionId`] immediately and performs
//! the connect on a background task. The registry decides every race between
//! that task and `disconnect`:
//!
//! - Success: the task re-checks membership under the registry lock and only
//!   then builds the channel. A handle that was disconnected in the meantime
//!   has its fresh socket dropped and no callback fires. The record's
//!   [`DeliveryGate`] is held until `on_result` returns, so `disconnect`
//!   waits out a delivery that already passed the check.
//! - Failure: the task reports the error only if it is the one that removes
//!   the handle. A failure arriving after `disconnect` is dropped.
//! - `disconnect`: whoever removes the handle first owns the cleanup.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::channel::{OwnerCloseCallback, TcpChannel};
use crate::error::{Result, TransportError};
use crate::handle::ConnectionId;
use crate::observe::{SharedObserver, TransportEvent, default_observer};
use crate::registry::{DeliveryGate, Registry};

/// Result of a successful connect.
#[derive(Debug)]
pub struct Connected {
    /// Local port chosen by the OS for this connection
    pub local_port: u16,
    /// The established channel; the caller owns its lifecycle from here
    pub channel: TcpChannel,
}

/// Lifecycle record for one outbound attempt.
#[derive(Default)]
struct ConnectRecord {
    /// Background connect task, stored once spawned
    task: Option<AbortHandle>,
    /// Set only after a successful connect
    channel: Option<TcpChannel>,
    delivery: Arc<DeliveryGate>,
}

/// Issues outbound connects and tracks them by handle.
///
/// Cloning shares the same registry. Dropping the connector does not tear
/// anything down; call [`Connector::disconnect_all`] for that.
#[derive(Clone)]
pub struct Connector {
    registry: Arc<Registry<ConnectionId, ConnectRecord>>,
    runtime: Handle,
    observer: SharedObserver,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("active", &self.registry.len())
            .finish()
    }
}

impl Connector {
    /// Create a connector that runs its tasks on the current tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime =
            Handle::try_current().map_err(|e| TransportError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(runtime))
    }

    /// Create a connector that runs its tasks on `runtime`.
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            runtime,
            observer: default_observer(),
        }
    }

    /// Replace the observer that receives events without a caller callback.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Start connecting to `address:port`.
    ///
    /// Returns before any network activity. `on_result` runs at most once on
    /// a background task, and never after `disconnect(handle)` has returned
    /// `true`. A zero `timeout` leaves the connect bounded only by the OS.
    pub fn connect<F>(
        &self,
        address: &str,
        port: u16,
        timeout: Duration,
        on_result: F,
    ) -> ConnectionId
    where
        F: FnOnce(Result<Connected>) + Send + 'static,
    {
        let delivery = Arc::new(DeliveryGate::default());
        let id = self.registry.insert(ConnectRecord {
            delivery: Arc::clone(&delivery),
            ..ConnectRecord::default()
        });
        let this = self.clone();
        let host = address.to_string();

        let task = self.runtime.spawn(async move {
            let target = format!("{}:{}", host, port);
            log::debug!(target: "tcpcom::connector", "Connect {} to {} started", id, target);

            let connect = TcpStream::connect((host.as_str(), port));
            let outcome = if timeout.is_zero() {
                connect.await.map_err(|e| TransportError::connect(&target, e))
            } else {
                match tokio::time::timeout(timeout, connect).await {
                    Ok(result) => result.map_err(|e| TransportError::connect(&target, e)),
                    Err(_) => Err(TransportError::connect_timeout(&target, timeout)),
                }
            };

            match outcome {
                Ok(stream) => this.adopt(id, &delivery, stream, &target, on_result),
                Err(error) => this.fail(id, error, on_result),
            }
        });

        // The task may already have finished and removed the record
        self.registry
            .with_record(id, |record| record.task = Some(task.abort_handle()));
        id
    }

    /// Cancel a pending connect or close an established connection.
    ///
    /// Returns whether `handle` was still registered. After `true`, no
    /// callback fires for this handle. If `on_result` is already running on
    /// another thread, this waits for it to return.
    pub fn disconnect(&self, handle: ConnectionId) -> bool {
        let Some(record) = self.registry.remove(handle) else {
            return false;
        };
        log::debug!(target: "tcpcom::connector", "Disconnecting {}", handle);

        record.delivery.wait_idle();
        if let Some(task) = record.task {
            // Drops an in-flight connect along with its socket
            task.abort();
        }
        if let Some(channel) = record.channel {
            channel.close();
        }
        true
    }

    /// Disconnect every handle known at the time of the call.
    pub fn disconnect_all(&self) {
        for handle in self.registry.ids() {
            self.disconnect(handle);
        }
    }

    /// Whether `handle` is pending or connected.
    pub fn is_pending_or_connected(&self, handle: ConnectionId) -> bool {
        self.registry.contains(handle)
    }

    /// Number of pending or connected handles.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand a connected stream to the caller if the handle is still owned.
    fn adopt<F>(
        &self,
        id: ConnectionId,
        delivery: &DeliveryGate,
        stream: TcpStream,
        target: &str,
        on_result: F,
    ) where
        F: FnOnce(Result<Connected>) + Send + 'static,
    {
        let local_port = match stream.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => return self.fail(id, TransportError::connect(target, e), on_result),
        };

        let _delivering = delivery.enter();
        let registry = Arc::downgrade(&self.registry);
        let adopted = self.registry.with_record(id, |record| {
            let channel = TcpChannel::new(
                stream,
                self.runtime.clone(),
                Arc::clone(&self.observer),
                release_on_close(registry, id),
            )?;
            record.channel = Some(channel.clone());
            Ok::<_, std::io::Error>(channel)
        });

        match adopted {
            Some(Ok(channel)) => {
                channel.announce();
                // The observer may have disconnected this handle
                if !self.registry.contains(id) {
                    self.observer
                        .on_event(&TransportEvent::ConnectDiscarded { id });
                    return;
                }
                log::debug!(
                    target: "tcpcom::connector",
                    "Connect {} to {} established from port {}",
                    id,
                    target,
                    local_port
                );
                on_result(Ok(Connected {
                    local_port,
                    channel,
                }));
            }
            Some(Err(e)) => self.fail(id, TransportError::connect(target, e), on_result),
            // Disconnected while connecting; the stream was dropped with the closure
            None => self
                .observer
                .on_event(&TransportEvent::ConnectDiscarded { id }),
        }
    }

    /// Report `error` only if this call is the one that removes the handle.
    fn fail<F>(&self, id: ConnectionId, error: TransportError, on_result: F)
    where
        F: FnOnce(Result<Connected>) + Send + 'static,
    {
        if self.registry.remove(id).is_some() {
            log::debug!(target: "tcpcom::connector", "Connect {} failed: {}", id, error);
            on_result(Err(error));
        } else {
            self.observer
                .on_event(&TransportEvent::ConnectFailureSuppressed {
                    id,
                    message: error.to_string(),
                });
        }
    }
}

/// Owner callback that drops `id` from the registry if it still exists.
fn release_on_close(
    registry: Weak<Registry<ConnectionId, ConnectRecord>>,
    id: ConnectionId,
) -> OwnerCloseCallback {
    Box::new(move || {
        if let Some(registry) = registry.upgrade()
            && registry.remove(id).is_some()
        {
            log::debug!(target: "tcpcom::connector", "Connection {} closed, handle released", id);
        }
    })
}
