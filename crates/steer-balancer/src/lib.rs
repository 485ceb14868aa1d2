//! steer-balancer — adaptive CDN selection engine.
//!
//! Routes live-streaming sessions across a pool of CDN backends and keeps
//! rebalancing them from observed load, cost, and per-client stalls.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!   ├── tick (every interval, never overlapping)
//!   │     poller → redistribute → scorer → cost → registry.publish → events.flush
//!   ├── on_request
//!   │     tracker.resolve → selector (ranking snapshot) → tracker.commit
//!   ├── BackendRegistry (ArcSwap'd ranking snapshot)
//!   ├── SessionTracker (version-checked session writes)
//!   ├── Controls (runtime settings)
//!   └── EventLog (buffered, flushed once per tick, broadcast to subscribers)
//! ```

pub mod controls;
pub mod cost;
pub mod engine;
pub mod error;
pub mod events;
pub mod poller;
pub mod redistribute;
pub mod registry;
pub mod scorer;
pub mod selector;
pub mod tracker;

pub use controls::{Controls, ControlsUpdate, Settings};
pub use engine::{Engine, RequestOutcome, TickReport, seed_backends};
pub use error::{BalancerError, BalancerResult};
pub use poller::{TelemetryReport, TelemetrySource, http_source, telemetry_source};
pub use registry::{BackendRegistry, Ranking, Scored};
pub use tracker::SessionPolicy;
