//! Cinnamon networked simulation core
//!
//! Keeps an authoritative server world and each client's predicted copy of
//! it consistent over UDP.
//!
//! - [`game::store`] holds entities as per-type component columns, stamped
//!   with the tick they last changed, and diffs them into snapshots.
//! - [`net::codec`] turns snapshots into little-endian frames and back.
//! - [`net::session`] is the sans-IO reliable/unreliable session;
//!   [`net::transport`] and [`net::client`] drive it over tokio sockets.
//! - [`game::tick_loop`] is the single writer of the server world, run at a
//!   fixed rate by [`game::runner`].
//! - [`client::predictor`] applies local input at once and reconciles
//!   against authoritative snapshots.
//!
//! # Features
//!
//! - `metrics_endpoint` - Prometheus/JSON metrics HTTP endpoint in the server binary (enabled by default)

pub mod client;
pub mod config;
pub mod error;
pub mod game;
pub mod metrics;
pub mod net;
pub mod util;
