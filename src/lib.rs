#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_async)]

//! relaytun library — the relay and agent building blocks behind the binary.
//!
//! - `tunnel` — registry, correlation table, routing, sessions, agent
//! - `config` — relay and agent configuration loading
//! - `error` — error taxonomy and its HTTP mapping
//! - `routes` — plain HTTP handlers shared by both planes

pub mod config;
pub mod error;
pub mod routes;
pub mod tunnel;

pub use config::{AgentConfig, Config};
pub use error::TunnelError;
pub use tunnel::pending::PendingRequests;
pub use tunnel::registry::Registry;
pub use tunnel::relay::{RelaySettings, RelayState};
