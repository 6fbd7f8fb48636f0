//! Sequential writer task for one channel.
//!
//! Every byte that leaves a channel goes through this task: explicit sends
//! and heartbeat ticks share one FIFO queue, so they reach the socket in
//! submission order and never interleave.
//!
//! # Shutdown
//!
//! When the channel's cancellation token fires, the writer closes its queue
//! (later submissions fail at the sender), then fails every send still
//! queued with [`TransportError::Disconnected`]. Each send therefore gets
//! exactly one completion.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};
use crate::observe::{SharedObserver, TransportEvent};

/// Completion callback for one `send`.
pub(crate) type SendCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// Unit of work for the writer task.
pub(crate) enum OutboundWrite {
    /// Caller-submitted payload; completion is always invoked exactly once.
    Send {
        payload: Vec<u8>,
        on_done: SendCompletion,
    },
    /// Heartbeat tick; failures go to the observer only.
    Heartbeat(Arc<[u8]>),
}

impl OutboundWrite {
    /// Fail this write without touching the socket.
    pub(crate) fn reject(self) {
        if let OutboundWrite::Send { on_done, .. } = self {
            on_done(Err(TransportError::Disconnected));
        }
    }
}

impl std::fmt::Debug for OutboundWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboundWrite::Send { payload, .. } => f
                .debug_struct("Send")
                .field("len", &payload.len())
                .finish(),
            OutboundWrite::Heartbeat(payload) => f
                .debug_tuple("Heartbeat")
                .field(&payload.len())
                .finish(),
        }
    }
}

/// Spawn the writer task that owns the socket's write half.
pub(crate) fn spawn_writer_task(
    runtime: &Handle,
    writer: OwnedWriteHalf,
    rx: mpsc::UnboundedReceiver<OutboundWrite>,
    cancel_token: CancellationToken,
    observer: SharedObserver,
    peer: Option<SocketAddr>,
) -> JoinHandle<()> {
    runtime.spawn(writer_loop(writer, rx, cancel_token, observer, peer))
}

async fn writer_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<OutboundWrite>,
    cancel_token: CancellationToken,
    observer: SharedObserver,
    peer: Option<SocketAddr>,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                log::debug!(
                    target: "tcpcom::channel::writer",
                    "Writer for {:?} cancelled, rejecting queued sends",
                    peer
                );
                rx.close();
                while let Some(pending) = rx.recv().await {
                    pending.reject();
                }
                return;
            }

            msg = rx.recv() => {
                match msg {
                    Some(OutboundWrite::Send { payload, on_done }) => {
                        let result = write_payload(&mut writer, &payload)
                            .await
                            .map_err(TransportError::Write);
                        if let Err(e) = &result {
                            log::debug!(
                                target: "tcpcom::channel::writer",
                                "Send to {:?} failed: {}",
                                peer,
                                e
                            );
                        }
                        on_done(result);
                    }
                    Some(OutboundWrite::Heartbeat(payload)) => {
                        if let Err(e) = write_payload(&mut writer, &payload).await {
                            observer.on_event(&TransportEvent::HeartbeatWriteFailed {
                                peer,
                                message: e.to_string(),
                            });
                        }
                    }
                    // Every sender is gone, which only happens once the channel is dropped
                    None => return,
                }
            }
        }
    }
}

/// Write the full buffer, then flush.
async fn write_payload(writer: &mut OwnedWriteHalf, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Spawn a fixed-rate ticker that feeds heartbeat writes into the writer queue.
///
/// The first tick fires immediately. The ticker stops when the channel is
/// cancelled or the writer queue is closed.
pub(crate) fn spawn_heartbeat_task(
    runtime: &Handle,
    period: Duration,
    payload: Arc<[u8]>,
    outbound: mpsc::UnboundedSender<OutboundWrite>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    if outbound
                        .send(OutboundWrite::Heartbeat(Arc::clone(&payload)))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        log::trace!(target: "tcpcom::channel::writer", "Heartbeat ticker stopped");
    })
}
