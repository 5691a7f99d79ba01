//! Runtime for the SMS relay: WebSocket broadcast hub, companion status
//! page, and the liveness supervision that keeps both alive.
//!
//! Start-to-finish flow: [`Supervisor::start`] brings up a [`ServerPair`]
//! serving the event port and the status port as one unit. SMS events enter
//! through [`BroadcastHub::ingest`] and fan out to every live subscriber as
//! a JSON envelope. The heartbeat and
//! [`Supervisor::on_connectivity_restored`] bring the pair back up after
//! failures.

pub mod config;
pub mod connection;
pub mod hub;
pub mod pair;
pub mod registry;
pub mod status;
pub mod supervisor;

pub use config::RelayConfig;
pub use connection::RelayConnection;
pub use hub::{BroadcastHub, HubHandle};
pub use pair::ServerPair;
pub use registry::ConnectionRegistry;
pub use status::{FixedAddr, LocalAddrResolver, StatusHandle};
pub use supervisor::{Supervisor, SupervisorState};
