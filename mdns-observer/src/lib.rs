//! Passive mDNS / DNS-SD observation over one shared multicast socket.

pub mod config;
pub mod dns;
pub mod error;
pub mod observer;
pub mod transport;

#[cfg(test)]
mod fixtures;

pub use config::{ObserverConfig, TransportConfig};
pub use error::{Error, Result};
pub use observer::{ListenerId, Observer, ObserverEvent, Scope, Subject};
pub use transport::{Handle, MessageKind, SendOutcome, SocketState, Subscription, Transport, TransportEvent};
