//! # ratelimitd - A Distributed Multi-Algorithm Rate Limiting Service
//!
//! ratelimitd answers one question fast and consistently across a fleet:
//! may `n` tokens be consumed for key `K` right now?
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────────────┐     ┌─────────────┐
//! │   Client    │────▶│    ratelimitd service    │────▶│    Redis    │
//! │   (APIs)    │     │                          │     │  (shared    │
//! └─────────────┘     └──────────────────────────┘     │   state)    │
//!                                  │                   └─────────────┘
//!                ┌────────┬───────┼────────┬───────────┐
//!                ▼        ▼       ▼        ▼           ▼
//!           ┌────────┐ ┌──────┐ ┌──────┐ ┌────────┐ ┌──────────┐
//!           │Resolver│ │Bucket│ │Compo-│ │Adaptive│ │Schedules │
//!           │ +cache │ │stores│ │site  │ │control │ │+ Geo     │
//!           └────────┘ └──────┘ └──────┘ └────────┘ └──────────┘
//! ```
//!
//! ## Core Components
//!
//! - **[`server::Server`]** - HTTP server built on Axum with graceful shutdown
//! - **[`service::RateLimitService`]** - orchestrator for one check call
//! - **[`store::Store`]** - the per-key atomic backend (local shards or Redis scripts)
//! - **[`algorithms`]** - token bucket, sliding window log, fixed window, leaky bucket
//! - **[`resolver::Resolver`]** - effective-config precedence chain with caching
//! - **[`composite::CompositeLimiter`]** - several sub-limits under one combination logic
//! - **[`adaptive::AdaptiveController`]** - limits revised from traffic and health signals
//! - **[`schedule::ScheduleManager`]** / **[`geo::GeoManager`]** - time and location overlays
//!
//! ## Request Flow
//!
//! 1. `POST /check` arrives at the Axum server
//! 2. The handler validates the key and token count
//! 3. The resolver produces the effective config (override → schedule →
//!    geo → adaptive → per-key → pattern → default)
//! 4. The store runs the algorithm step atomically for the key
//! 5. Metrics record the outcome; the adaptive ring ingests the event
//! 6. Denials answer 429 with `Retry-After` and `X-RateLimit-*` headers
//!
//! ## Storage Modes
//!
//! | Mode        | Use Case                        | State Persistence |
//! |-------------|---------------------------------|-------------------|
//! | Local       | Development, single instance    | In-memory shards  |
//! | Distributed | Production, fleet of replicas   | Redis             |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ratelimitd::{config::Config, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let server = Server::new(config).await?;
//!     server.run().await
//! }
//! ```

pub mod adaptive;
pub mod algorithms;
pub mod clock;
pub mod composite;
pub mod config;
pub mod error;
pub mod geo;
pub mod handlers;
pub mod limits;
pub mod metrics;
pub mod resolver;
pub mod schedule;
pub mod server;
pub mod service;
pub mod store;
pub mod validation;

// Re-export commonly used types
pub use adaptive::AdaptiveController;
pub use composite::{CombinationLogic, CompositeConfig, CompositeLimiter};
pub use config::Config;
pub use error::Error;
pub use limits::{Algorithm, RateLimitConfig};
pub use resolver::Resolver;
pub use service::RateLimitService;
pub use store::Store;

/// Result type alias for ratelimitd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Version of the ratelimitd library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
