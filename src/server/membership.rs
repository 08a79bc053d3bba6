//! Cluster membership and write-quorum configuration.
//!
//! Three process-wide items: the quorum threshold `w`, the ordered master
//! set, and the ordered replica set. Seeded at node startup and replaced
//! only by an administrative broadcast; snapshot-read once per coordinator
//! operation so `w` never changes mid-operation.

use std::collections::HashSet;

use crate::utils::KeystoneError;

use serde::{Deserialize, Serialize};

/// Node ID type.
pub type NodeId = u8;

/// Process-wide cluster configuration.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Write quorum threshold.
    pub w: u8,

    /// Masters: vote in the write quorum and own authoritative state.
    pub masters: Vec<NodeId>,

    /// Replicas: passively apply shipped trans-logs and serve dirty reads.
    pub replicas: Vec<NodeId>,
}

impl ClusterConfig {
    /// Composes a validated configuration.
    pub fn new(
        w: u8,
        masters: Vec<NodeId>,
        replicas: Vec<NodeId>,
    ) -> Result<Self, KeystoneError> {
        let config = ClusterConfig {
            w,
            masters,
            replicas,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants: masters non-empty and duplicate-free,
    /// `1 <= w <= |masters|`, replicas duplicate-free and disjoint from
    /// masters.
    pub fn validate(&self) -> Result<(), KeystoneError> {
        if self.masters.is_empty() {
            return Err(KeystoneError::msg("masters set is empty"));
        }
        let masters: HashSet<NodeId> = self.masters.iter().copied().collect();
        if masters.len() != self.masters.len() {
            return Err(KeystoneError::msg("duplicate ID in masters set"));
        }
        let replicas: HashSet<NodeId> =
            self.replicas.iter().copied().collect();
        if replicas.len() != self.replicas.len() {
            return Err(KeystoneError::msg("duplicate ID in replicas set"));
        }
        if !masters.is_disjoint(&replicas) {
            return Err(KeystoneError::msg(
                "masters and replicas sets overlap",
            ));
        }
        if self.w == 0 || self.w as usize > self.masters.len() {
            return Err(KeystoneError(format!(
                "invalid w {} for {} masters",
                self.w,
                self.masters.len()
            )));
        }
        Ok(())
    }

    /// Returns the majority quorum size for a given master count.
    #[inline]
    pub fn majority(num_masters: usize) -> u8 {
        (num_masters / 2 + 1) as u8
    }
}

#[cfg(test)]
mod membership_tests {
    use super::*;

    #[test]
    fn valid_config() -> Result<(), KeystoneError> {
        let config = ClusterConfig::new(2, vec![0, 1, 2], vec![3, 4])?;
        assert_eq!(config.w, 2);
        config.validate()
    }

    #[test]
    fn invalid_w() {
        assert!(ClusterConfig::new(0, vec![0, 1, 2], vec![]).is_err());
        assert!(ClusterConfig::new(4, vec![0, 1, 2], vec![]).is_err());
    }

    #[test]
    fn invalid_sets() {
        assert!(ClusterConfig::new(1, vec![], vec![0]).is_err());
        assert!(ClusterConfig::new(1, vec![0, 0], vec![]).is_err());
        assert!(ClusterConfig::new(1, vec![0, 1], vec![2, 2]).is_err());
        assert!(ClusterConfig::new(1, vec![0, 1], vec![1]).is_err());
    }

    #[test]
    fn majority_sizes() {
        assert_eq!(ClusterConfig::majority(1), 1);
        assert_eq!(ClusterConfig::majority(3), 2);
        assert_eq!(ClusterConfig::majority(5), 3);
    }
}
