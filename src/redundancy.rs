use anyhow::{anyhow, Context, Result};
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::config::RaidLevel;

/// Computes and repairs the redundancy of one stripe.
///
/// Every redundant level is modelled as an MDS code with the level's parity
/// count: XOR parity, P+Q and mirroring all tolerate exactly that many lost
/// members, which is all the simulator needs.
#[derive(Debug)]
pub struct StripeCodec {
    data_shards: usize,
    parity_shards: usize,
    rs: Option<ReedSolomon>,
}

impl StripeCodec {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(anyhow!("stripe needs at least one data shard"));
        }
        let rs = if parity_shards > 0 {
            Some(
                ReedSolomon::new(data_shards, parity_shards)
                    .context("Failed to create Reed-Solomon encoder")?,
            )
        } else {
            None
        };
        Ok(StripeCodec {
            data_shards,
            parity_shards,
            rs,
        })
    }

    pub fn for_level(level: RaidLevel, members: usize) -> Result<Self> {
        Self::new(level.data_members(members), level.parity_count(members))
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Recompute the parity shards from the data shards in place
    pub fn encode(&self, shards: &mut [Vec<u8>]) -> Result<()> {
        if shards.len() != self.total_shards() {
            return Err(anyhow!(
                "expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            ));
        }
        match &self.rs {
            Some(rs) => rs
                .encode(shards)
                .context("Failed to encode with Reed-Solomon"),
            None => Ok(()),
        }
    }

    /// Fill in missing shards, data and parity alike
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let missing = shards.iter().filter(|s| s.is_none()).count();
        if missing == 0 {
            return Ok(());
        }
        if missing > self.parity_shards {
            return Err(anyhow!(
                "{} shards missing, only {} can be rebuilt",
                missing,
                self.parity_shards
            ));
        }
        match &self.rs {
            Some(rs) => rs
                .reconstruct(shards)
                .context("Failed to reconstruct with Reed-Solomon"),
            None => Err(anyhow!("no redundancy to rebuild from")),
        }
    }
}

#[cfg(test)]
#[path = "../tests/unit/redundancy_tests.rs"]
mod tests;
