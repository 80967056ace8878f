//! Reverse tunnel: relay and agent.
//!
//! - **Relay** (`relaytun server`): keeps the registry of live tunnels and
//!   routes public requests to them by subdomain.
//! - **Agent** (`relaytun start`): registers a local service with the relay,
//!   either for direct dialing or over a multiplexed WebSocket session.

pub mod agent;
pub mod envelope;
pub mod pending;
pub mod reaper;
pub mod registry;
pub mod relay;
pub mod tcp_relay;
