//! Static partitioning of fids across subscriber/consumer pairs.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::event::HubEvent;

/// Shard key used when the deployment is not sharded.
pub const UNSHARDED_KEY: &str = "all";

/// Which slice of the fid space a subscriber/consumer pair owns.
///
/// `total_shards == 0` means unsharded: every fid is owned. Otherwise a fid belongs to shard
/// `fid % total_shards`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ShardConfig {
    pub total_shards: u32,
    pub shard_index: u32,
}

impl ShardConfig {
    pub fn unsharded() -> Self {
        Self::default()
    }

    /// Creates a validated shard configuration.
    pub fn new(total_shards: u32, shard_index: u32) -> Result<Self, SyncError> {
        let config = Self {
            total_shards,
            shard_index,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.total_shards == 0 && self.shard_index != 0 {
            return Err(SyncError::Configuration(format!(
                "shard index {} given for an unsharded deployment",
                self.shard_index
            )));
        }
        if self.total_shards > 0 && self.shard_index >= self.total_shards {
            return Err(SyncError::Configuration(format!(
                "shard index {} out of range for {} shards",
                self.shard_index, self.total_shards
            )));
        }
        Ok(())
    }

    pub fn is_sharded(&self) -> bool {
        self.total_shards > 0
    }

    pub fn owns_fid(&self, fid: u64) -> bool {
        if !self.is_sharded() {
            return true;
        }
        fid % u64::from(self.total_shards) == u64::from(self.shard_index)
    }

    /// Whether this shard owns `event`. An event without an owning fid is only accepted
    /// when unsharded.
    pub fn owns(&self, event: &HubEvent) -> bool {
        match event.fid() {
            Some(fid) => self.owns_fid(fid),
            None => !self.is_sharded(),
        }
    }

    /// `"all"` when unsharded, otherwise the shard index.
    pub fn shard_key(&self) -> String {
        if self.is_sharded() {
            self.shard_index.to_string()
        } else {
            UNSHARDED_KEY.to_string()
        }
    }

    /// The durable stream key for this shard under `prefix`.
    pub fn stream_key(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.shard_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsharded_owns_everything() {
        let shard = ShardConfig::unsharded();
        assert!((0..100).all(|fid| shard.owns_fid(fid)));
        assert_eq!(shard.shard_key(), "all");
        assert_eq!(shard.stream_key("hub:events"), "hub:events:all");
    }

    #[test]
    fn sharded_owns_fids_congruent_to_its_index() {
        let shard = ShardConfig::new(2, 0).unwrap();
        let owned: Vec<u64> = (1..=4).filter(|fid| shard.owns_fid(*fid)).collect();
        assert_eq!(owned, vec![2, 4]);
        assert_eq!(shard.shard_key(), "0");
    }

    #[test]
    fn every_fid_has_exactly_one_owner() {
        let shards: Vec<ShardConfig> = (0..3).map(|i| ShardConfig::new(3, i).unwrap()).collect();
        for fid in 0..50 {
            assert_eq!(shards.iter().filter(|s| s.owns_fid(fid)).count(), 1);
        }
    }

    #[test]
    fn index_out_of_range_is_a_configuration_error() {
        assert!(ShardConfig::new(2, 2).is_err());
        assert!(ShardConfig::new(0, 1).is_err());
        assert!(ShardConfig::new(0, 0).is_ok());
    }
}
