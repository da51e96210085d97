//! Plans and steps.
//!
//! A [`Plan`] describes the desired local state as a list of [`Step`]s. Steps
//! must be idempotent: the reconciler runs the whole plan again after every
//! failure and periodically after success.

use async_trait::async_trait;
use std::fmt;
use steward_core::Result;

/// Produces the steps converging local state.
#[async_trait]
pub trait Plan: Send + Sync {
    fn name(&self) -> String;

    /// Returns a fresh list of steps. Called on every reconciler tick.
    async fn create(&self) -> Result<Vec<Box<dyn Step>>>;
}

/// One idempotent unit of work.
#[async_trait]
pub trait Step: Send + Sync + fmt::Debug {
    fn name(&self) -> String;

    /// Performs the work and returns substeps to run immediately after,
    /// before any remaining sibling.
    async fn run(&self) -> Result<Vec<Box<dyn Step>>>;
}
