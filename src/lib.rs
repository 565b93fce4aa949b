//! dripflow - trigger-driven marketing automation engine
//!
//! dripflow enrolls contacts into per-workspace automations when activity
//! events arrive, then walks each contact through a graph of typed nodes
//! over time: emails, delays, branches, filters, A/B splits and list
//! membership changes.
//!
//! ## Key Pieces
//!
//! - **Trigger matcher**: turns timeline events into enrollments, deduplicating `once` triggers
//! - **Graph walk**: runs nodes until a run waits, ends, or needs a retry
//! - **Scheduler**: leases due runs and resumes them, skipping paused and deleted automations
//! - **Lifecycle**: draft → live ⇄ paused, soft delete with run exit
//!
//! ## Example
//!
//! ```yaml
//! name: welcome-series
//! trigger:
//!   event_kind: list.subscribed
//!   list_id: newsletter
//!   frequency: once
//! root_node_id: start
//! nodes:
//!   - id: start
//!     type: trigger
//!     next_node_id: welcome
//!
//!   - id: welcome
//!     type: email
//!     config: { template_id: welcome }
//!     next_node_id: wait
//!
//!   - id: wait
//!     type: delay
//!     config: { duration: 3, unit: days }
//!     next_node_id: tips
//!
//!   - id: tips
//!     type: email
//!     config: { template_id: tips }
//! ```

pub mod automation;
pub mod conditions;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod nodes;
pub mod services;
pub mod shutdown;
pub mod storage;
pub mod triggers;
pub mod variant;

pub use error::{Error, Result};
