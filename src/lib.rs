//! Probe DNS - a fleet of per-location DNS probe actors.
//!
//! One probe actor runs at each physical point-of-presence. Each actor
//! resolves names through DNS-over-HTTPS or DNS-over-TLS resolvers and caches
//! the answers in a partition of its own, so results reflect what that
//! location sees. A reconciliation controller keeps the fleet aligned with an
//! external list of live locations.
//!
//! ## Features
//!
//! - Placement-verified actor creation with a bounded attempt budget
//! - Self-checking actors that evict themselves on drift or when orphaned
//! - DoH (binary and JSON) and DoT resolution with cancellation and deadlines
//! - TTL-derived, location-partitioned response cache
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                            probe-dns                               │
//! │                                                                    │
//! │  ┌──────────────┐   desired    ┌──────────────────┐                │
//! │  │  Discovery   │─────────────▶│   Reconciler     │──┐ create/     │
//! │  │  feed        │              │   (controller)   │  │ evict       │
//! │  └──────────────┘              └────────┬─────────┘  ▼             │
//! │                                         │     ┌───────────────┐    │
//! │                               rows      │     │ ActorNamespace│    │
//! │                                         ▼     └───────┬───────┘    │
//! │                              ┌──────────────────┐     │            │
//! │                              │  Fleet registry  │◀────┤ self-check │
//! │                              │  (SQLite)        │     ▼            │
//! │                              └──────────────────┘  ┌────────────┐  │
//! │                                                    │ ProbeActor │  │
//! │  ┌──────────────┐   DoH / DoT   ┌──────────────┐   │  + cache   │  │
//! │  │  Resolvers   │◀──────────────│  DnsClient   │◀──┤  partition │  │
//! │  └──────────────┘               └──────────────┘   └────────────┘  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Actor lifecycle
//!
//! ```text
//! Unlocked ──lock(code)──▶ Locked ──drift / orphan / evict()──▶ Evicted
//!     │                                                            ▲
//!     └─────────────────────────── evict() ────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use probe_dns::{Reconciler, SqliteRegistry};
//!
//! let report = reconciler.run_cycle().await?;
//! for outcome in &report.created {
//!     println!("{}: {:?} after {} attempts", outcome.code, outcome.result, outcome.attempts);
//! }
//! ```

#![warn(missing_docs)]

pub mod actor;
pub mod cache;
pub mod codec;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod local;
pub mod location;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod substrate;
pub mod telemetry;
pub mod vantage;

// Re-export main types
pub use actor::{ProbeActor, ProbeDeps};
pub use cache::ResponseCache;
pub use codec::{AnswerData, DnsAnswer};
pub use config::{Config, TelemetryConfig};
pub use controller::{CycleReport, Reconciler};
pub use error::ProbeError;
pub use local::LocalNamespace;
pub use location::{FineLocationCode, Location};
pub use registry::{Registry, SqliteRegistry};
pub use resolver::{CancelSignal, DnsClient, ResolverEndpoint};
pub use service::FleetService;
pub use substrate::ProbeId;
