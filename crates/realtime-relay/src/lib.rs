//! Realtime event client for the homeguard platform.
//!
//! This crate provides:
//! - A supervised connection that authenticates with the session's access
//!   token and re-authenticates before it expires
//! - Automatic reconnection with capped, jittered exponential backoff
//! - Client-side subscriptions filtered by event type, kept across reconnects
//! - Status notifications over a broadcast channel

mod backoff;
mod client;
mod error;
mod messages;
mod subscription;
mod transport;

#[cfg(test)]
mod tests;

pub use backoff::{BackoffState, ReconnectBackoff};
pub use client::{ConnectionState, RealtimeClient, RealtimeStatus};
pub use error::{RelayError, RelayResult};
pub use messages::{ClientFrame, Event, EventType, ServerFrame};
pub use subscription::{
    DispatchReport, EventFilter, EventHandler, EventSubscription, HandlerError, HandlerFailure,
    SubscriptionId,
};
pub use transport::{Connector, FrameTransport, WsConnector};
