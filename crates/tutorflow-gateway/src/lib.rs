//! WebSocket gateway for tutoring turns.
//!
//! Clients send `turn.send` requests over `/ws` and receive the turn's
//! delivery events as `turn.event` frames, followed by the response frame
//! carrying the turn summary.

pub mod connection;
pub mod hot_reload;
pub mod methods;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use hot_reload::ResponderWatcher;
pub use server::{router, serve, start_gateway};
pub use state::GatewayState;
