//! Asynchronous TCP connection layer.
//!
//! [`Connector`] issues outbound connects and [`Listener`] accepts inbound
//! peers. Both hand established sockets to the caller as [`TcpChannel`]s and
//! track them by integer handle so a caller can cancel work that is still in
//! flight. All background work runs on a tokio runtime; results are delivered
//! through callbacks.

pub mod channel;
pub mod config;
pub mod connector;
pub mod error;
pub mod handle;
pub mod listener;
pub mod observe;
mod registry;

pub use channel::TcpChannel;
pub use config::TransportConfig;
pub use connector::{Connected, Connector};
pub use error::{Result, TransportError};
pub use handle::{ConnectionId, ListenerId};
pub use listener::{BindEvent, Listener, address_key};
pub use observe::{CloseReason, LogObserver, SharedObserver, TransportEvent, TransportObserver};
