// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-independent hashing for routing and sharding.
//!
//! `std::hash::DefaultHasher` is randomly seeded per process, so it cannot be
//! used for anything that must agree across instances or restarts. These
//! helpers take the first four bytes of SHA-256 instead.

use sha2::{Digest, Sha256};

/// Stable 32-bit hash of a string.
pub fn stable_hash(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Shard owning all timers and history rows of a workflow.
///
/// `hash(namespace + "/" + workflow) mod num_shards`. A shard count of zero is
/// treated as one.
pub fn shard_for(namespace_id: &str, workflow_id: &str, num_shards: u32) -> u32 {
    let key = format!("{}/{}", namespace_id, workflow_id);
    stable_hash(&key) % num_shards.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_hash_known_value() {
        // sha256("") = e3b0c442...
        assert_eq!(stable_hash(""), 0xe3b0_c442);
    }

    #[test]
    fn test_shard_for_is_deterministic_and_bounded() {
        for i in 0..1000 {
            let workflow = format!("wf-{}", i);
            let shard = shard_for("acme", &workflow, 16);
            assert!(shard < 16);
            assert_eq!(shard, shard_for("acme", &workflow, 16));
        }
    }

    #[test]
    fn test_shard_for_uses_namespace() {
        let differs = (0..100).any(|i| {
            let workflow = format!("wf-{}", i);
            shard_for("acme", &workflow, 64) != shard_for("globex", &workflow, 64)
        });
        assert!(differs);
    }

    #[test]
    fn test_shard_for_zero_shards() {
        assert_eq!(shard_for("acme", "wf-1", 0), 0);
    }
}
