//! Caller-visible handle types for connectors and listeners.
//!
//! Handles are opaque, monotonically assigned integers. Wrapping them in
//! newtypes keeps a `ConnectionId` from being passed to `Listener::unbind`.

use std::fmt;

/// Handle identifying one pending-or-established outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Handle identifying one bound listener and its accepted peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

macro_rules! impl_handle {
    ($name:ident) => {
        impl $name {
            /// Get the underlying integer value.
            #[inline]
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_handle!(ConnectionId);
impl_handle!(ListenerId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trips_through_u64() {
        let id = ConnectionId::from(42);
        assert_eq!(id.as_u64(), 42);
        assert_eq!(u64::from(id), 42);
    }

    #[test]
    fn handle_display_is_bare_integer() {
        assert_eq!(ListenerId::from(7).to_string(), "7");
    }
}
