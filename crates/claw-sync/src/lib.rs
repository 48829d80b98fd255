//! # claw-sync
//!
//! Polling sync client that mirrors cluster state from the admin REST API
//! into a local cache and notifies consumers as entities resolve.
//!
//! ## Overview
//!
//! ```text
//!   full sync ──► EntityStore ◄── FetchQueue (one fetch in flight)
//!                     ▲                 ▲
//!                     │ deletions       │ changed ids
//!                     └──── Reconciler ─┘
//!                               ▲
//!                     PollRateController (timer)
//! ```
//!
//! Every write to the store publishes a [`SyncEvent`] through the
//! [`ChangeNotifier`], so a consumer that asked for `node/7` can wait for
//! `Topic::Entity(node/7)` regardless of whether the fetch stored, kept or
//! evicted it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use claw_sync::{HttpBackend, SyncConfig, SyncEngine};
//!
//! # async fn example() -> Result<(), claw_sync::SyncError> {
//! let config = SyncConfig::new("https://admin.example.com");
//! let backend = HttpBackend::from_config(&config)?;
//! let engine = SyncEngine::new(backend, config)?;
//!
//! engine.start().await;
//! engine.run(async { let _ = tokio::signal::ctrl_c().await; }).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backend endpoints
//!
//! | Endpoint | Method | Use |
//! |----------|--------|-----|
//! | `/api/v2/{kind}s` | GET | Full collection load |
//! | `/api/v2/{kind}s/{id}` | GET | Single entity refresh |
//! | `/api/status/active?age=N` | PUT | Change summary |
//! | `/health` | GET | Optional subsystem discovery |
//! | `/api/v2/barclamps` | POST | Barclamp upload |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod engine;
pub mod entity;
pub mod errlog;
pub mod error;
pub mod features;
pub mod notify;
pub mod poll;
pub mod queue;
pub mod reconcile;
pub mod store;
pub mod tenants;

pub use client::{ActiveRequest, ActiveSummary, Backend, HttpBackend};
pub use config::SyncConfig;
pub use engine::{CycleReport, SyncEngine};
pub use entity::{Entity, EntityId, EntityKey, EntityKind};
pub use errlog::{ErrorLog, ErrorRecord};
pub use error::{SyncError, SyncResult};
pub use features::{AuxiliaryData, FeatureFlags, Subsystem};
pub use notify::{ChangeNotifier, SubscriptionId, SyncEvent, Topic};
pub use poll::{PollPolicy, PollRateController, PollWait};
pub use queue::{DrainReport, FetchQueue, FetchTask, TaskExecutor, TaskOutcome};
pub use reconcile::{ReconcileReport, Reconciler};
pub use store::EntityStore;
pub use tenants::TenantDirectory;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
