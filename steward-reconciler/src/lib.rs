//! # Steward Reconciler
//!
//! Converges local node state by repeatedly executing a [`Plan`]:
//!
//! - every tick asks the plan for a fresh list of [`Step`]s
//! - steps run depth-first, substeps immediately after their parent
//! - the first failing step aborts the tick; the plan is retried after
//!   `timeout`
//! - a successful tick is repeated after `resync_timeout` to correct drift
//! - installing a new plan cancels the running one first

pub mod config;
pub mod plan;
pub mod reconciler;

pub use config::{ReconcilerConfig, DEFAULT_RESYNC_TIMEOUT, DEFAULT_TIMEOUT};
pub use plan::{Plan, Step};
pub use reconciler::Reconciler;
