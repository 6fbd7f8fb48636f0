//! Observability hook for transport events.
//!
//! Failures that have no caller-facing callback (heartbeat writes, socket
//! shutdown errors, results discarded after a cancel) are reported here
//! instead of being dropped. The default [`LogObserver`] forwards them to the
//! `log` facade; tests inject closures to assert on them.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::handle::{ConnectionId, ListenerId};

/// Why a channel was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called by the owner or caller
    Explicit,
    /// The read path failed; carries the failure message
    Unsolicited(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Explicit => write!(f, "closed explicitly"),
            CloseReason::Unsolicited(message) => write!(f, "connection lost: {}", message),
        }
    }
}

/// Structured event emitted by channels, connectors, and listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A channel was created over a connected socket
    ChannelOpened {
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    },
    /// A channel completed teardown
    ChannelClosed {
        peer: Option<SocketAddr>,
        reason: CloseReason,
    },
    /// A heartbeat tick could not be written
    HeartbeatWriteFailed {
        peer: Option<SocketAddr>,
        message: String,
    },
    /// Shutting down a socket during teardown failed
    SocketShutdownFailed {
        peer: Option<SocketAddr>,
        message: String,
    },
    /// A connect succeeded after its handle was disconnected; the socket was closed
    ConnectDiscarded { id: ConnectionId },
    /// A connect failed after its handle was disconnected; nothing was reported
    ConnectFailureSuppressed { id: ConnectionId, message: String },
    /// A peer was accepted after its listener was unbound; the socket was closed
    PeerDiscarded {
        id: ListenerId,
        peer: Option<SocketAddr>,
    },
    /// An accept loop stopped. `reported` tells whether the bind callback saw the error.
    AcceptLoopEnded {
        id: ListenerId,
        message: String,
        reported: bool,
    },
}

/// Receiver of [`TransportEvent`]s.
pub trait TransportObserver: Send + Sync {
    fn on_event(&self, event: &TransportEvent);
}

impl<F> TransportObserver for F
where
    F: Fn(&TransportEvent) + Send + Sync,
{
    fn on_event(&self, event: &TransportEvent) {
        self(event)
    }
}

/// Shared observer handle held by channels and managers.
pub type SharedObserver = Arc<dyn TransportObserver>;

/// Observer that writes every event to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl TransportObserver for LogObserver {
    fn on_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::ChannelOpened { peer, local } => debug!(
                target: "tcpcom::channel",
                "Channel opened (local {:?}, peer {:?})",
                local,
                peer
            ),
            TransportEvent::ChannelClosed { peer, reason } => match reason {
                CloseReason::Explicit => debug!(
                    target: "tcpcom::channel",
                    "Channel to {:?} {}",
                    peer,
                    reason
                ),
                CloseReason::Unsolicited(_) => info!(
                    target: "tcpcom::channel",
                    "Channel to {:?} {}",
                    peer,
                    reason
                ),
            },
            TransportEvent::HeartbeatWriteFailed { peer, message } => debug!(
                target: "tcpcom::channel",
                "Heartbeat to {:?} failed: {}",
                peer,
                message
            ),
            TransportEvent::SocketShutdownFailed { peer, message } => warn!(
                target: "tcpcom::channel",
                "Socket shutdown for {:?} failed: {}",
                peer,
                message
            ),
            TransportEvent::ConnectDiscarded { id } => debug!(
                target: "tcpcom::connector",
                "Connect {} completed after disconnect, closing socket",
                id
            ),
            TransportEvent::ConnectFailureSuppressed { id, message } => debug!(
                target: "tcpcom::connector",
                "Connect {} failed after disconnect: {}",
                id,
                message
            ),
            TransportEvent::PeerDiscarded { id, peer } => debug!(
                target: "tcpcom::listener",
                "Listener {} already unbound, dropping peer {:?}",
                id,
                peer
            ),
            TransportEvent::AcceptLoopEnded {
                id,
                message,
                reported,
            } => {
                if *reported {
                    warn!(
                        target: "tcpcom::listener",
                        "Listener {} stopped accepting: {}",
                        id,
                        message
                    );
                } else {
                    debug!(
                        target: "tcpcom::listener",
                        "Listener {} accept loop ended after unbind: {}",
                        id,
                        message
                    );
                }
            }
        }
    }
}

/// The observer used when none is injected.
pub fn default_observer() -> SharedObserver {
    Arc::new(LogObserver)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records every event for later assertions.
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        events: Mutex<Vec<TransportEvent>>,
    }

    impl RecordingObserver {
        pub(crate) fn events(&self) -> Vec<TransportEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl TransportObserver for RecordingObserver {
        fn on_event(&self, event: &TransportEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
