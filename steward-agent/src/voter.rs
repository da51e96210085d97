//! Election participation of the local node.

use async_trait::async_trait;
use steward_core::Result;
use steward_leader::CandidateHandle;

/// Controls whether the local node takes part in the election.
#[async_trait]
pub trait Voter: Send + Sync {
    /// Enters the election.
    async fn add_voter(&self) -> Result<()>;

    /// Leaves the election, resigning leadership if held.
    async fn remove_voter(&self) -> Result<()>;
}

#[async_trait]
impl Voter for CandidateHandle {
    async fn add_voter(&self) -> Result<()> {
        self.pause(false)?;
        Ok(())
    }

    async fn remove_voter(&self) -> Result<()> {
        self.pause(true)?;
        Ok(())
    }
}
