//! Realtime client scenarios against an in-memory connection.
//!
//! - `harness.rs`  - mock connector, scripted server socket, fake credentials
//! - `dispatch.rs` - filtering, ordering, handler isolation, unsubscribe
//! - `reconnect.rs` - connection loss, backoff, resumption
//! - `refresh.rs`  - credential refresh before and during a connection
//! - `shutdown.rs` - stop semantics
