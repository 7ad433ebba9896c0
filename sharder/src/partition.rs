//! Shard partitioning and guild routing.

use serde::{Deserialize, Serialize};

/// Inclusive range of shard ids owned by one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    pub first: u32,
    pub last: u32,
    /// Global shard count, identical across a partition.
    pub total: u32,
}

impl ShardRange {
    pub fn len(&self) -> u32 {
        self.last - self.first + 1
    }

    pub fn contains(&self, shard: u32) -> bool {
        (self.first..=self.last).contains(&shard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("shard total must be at least 1")]
    NoShards,
    #[error("cluster count must be at least 1")]
    NoClusters,
}

/// Split `[0, total)` across `clusters` contiguous ranges.
///
/// The first `total % clusters` ranges get one extra shard. When there are
/// fewer shards than clusters, the cluster count is clamped to `total`.
pub fn compute_partition(total: u32, clusters: u32) -> Result<Vec<ShardRange>, PartitionError> {
    if total == 0 {
        return Err(PartitionError::NoShards);
    }
    if clusters == 0 {
        return Err(PartitionError::NoClusters);
    }

    let clusters = clusters.min(total);
    let base = total / clusters;
    let extra = total % clusters;

    let mut ranges = Vec::with_capacity(clusters as usize);
    let mut first = 0;
    for i in 0..clusters {
        let len = base + u32::from(i < extra);
        ranges.push(ShardRange {
            first,
            last: first + len - 1,
            total,
        });
        first += len;
    }
    Ok(ranges)
}

/// Shard that receives events for `guild_id`.
pub fn shard_for_guild(guild_id: u64, total: u32) -> u32 {
    debug_assert!(total > 0);
    ((guild_id >> 22) % u64::from(total.max(1))) as u32
}

/// Index of the range owning `shard`.
pub fn owner_of(ranges: &[ShardRange], shard: u32) -> Option<usize> {
    ranges.iter().position(|r| r.contains(shard))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(ranges: &[ShardRange]) -> Vec<(u32, u32)> {
        ranges.iter().map(|r| (r.first, r.last)).collect()
    }

    #[test]
    fn seven_shards_over_three_clusters() {
        let ranges = compute_partition(7, 3).unwrap();
        assert_eq!(bounds(&ranges), vec![(0, 2), (3, 4), (5, 6)]);
        assert!(ranges.iter().all(|r| r.total == 7));
    }

    #[test]
    fn partition_covers_without_gaps_or_overlaps() {
        for total in 1..=64 {
            for clusters in 1..=12 {
                let ranges = compute_partition(total, clusters).unwrap();
                assert_eq!(ranges.len() as u32, clusters.min(total));
                assert_eq!(ranges[0].first, 0);
                assert_eq!(ranges.last().unwrap().last, total - 1);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].last + 1, pair[1].first);
                }
                let sizes: Vec<u32> = ranges.iter().map(ShardRange::len).collect();
                let max = *sizes.iter().max().unwrap();
                let min = *sizes.iter().min().unwrap();
                assert!(max - min <= 1, "uneven split {sizes:?}");
                assert_eq!(sizes.iter().sum::<u32>(), total);
            }
        }
    }

    #[test]
    fn clamps_clusters_to_shards() {
        let ranges = compute_partition(2, 5).unwrap();
        assert_eq!(bounds(&ranges), vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn rejects_empty_inputs() {
        assert_eq!(compute_partition(0, 3), Err(PartitionError::NoShards));
        assert_eq!(compute_partition(3, 0), Err(PartitionError::NoClusters));
    }

    #[test]
    fn routes_guild_to_owning_cluster() {
        let guild = 360620343729061908u64;
        let ranges = compute_partition(4, 2).unwrap();
        let shard = shard_for_guild(guild, 4);
        assert_eq!(shard, ((guild >> 22) % 4) as u32);
        assert_eq!(shard, 3);
        assert_eq!(owner_of(&ranges, shard), Some(1));
    }

    #[test]
    fn guild_routing_is_stable() {
        for guild in [0u64, 1 << 22, 81384788765712384, u64::MAX] {
            assert_eq!(shard_for_guild(guild, 16), shard_for_guild(guild, 16));
            assert!(shard_for_guild(guild, 16) < 16);
        }
    }
}
