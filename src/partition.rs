// Copyright 2025 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Splits the key space between live controller replicas.
//!
//! Every key hashes into the 64-bit space; each replica owns one contiguous range of it. The
//! ranges come from a [`PartitionMembership`] provider and change whenever replicas join or
//! leave.

pub mod registry;

use crate::types::key::ObjectKey;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

/// Position of a key in the partitioned hash space.
pub fn key_hash(key: &ObjectKey) -> u64 {
    let digest = Sha256::digest(key.to_string().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// The hash range owned by this replica; both bounds are inclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub revision: u64,
    pub lower: u64,
    pub upper: u64,
    pub index: usize,
    pub members: usize,
}

impl PartitionAssignment {
    /// The whole key space, for a single replica.
    pub fn whole() -> Self {
        Self::slice(0, 1, 0)
    }

    /// Range `index` of `members` equal contiguous ranges.
    pub fn slice(index: usize, members: usize, revision: u64) -> Self {
        let members = members.max(1);
        let index = index.min(members - 1);
        let bound = |i: usize| ((i as u128) << 64) / members as u128;
        let lower = u64::try_from(bound(index)).unwrap_or(u64::MAX);
        let upper = u64::try_from(bound(index + 1) - 1).unwrap_or(u64::MAX);

        Self {
            revision,
            lower,
            upper,
            index,
            members,
        }
    }

    pub fn owns(&self, key: &ObjectKey) -> bool {
        let hash = key_hash(key);
        self.lower <= hash && hash <= self.upper
    }

    /// Same range and membership, regardless of revision.
    pub fn same_range(&self, other: &Self) -> bool {
        self.lower == other.lower && self.upper == other.upper && self.members == other.members
    }
}

/// Source of the current partition assignment of this replica.
pub trait PartitionMembership: Send + Sync {
    fn current(&self) -> PartitionAssignment;

    /// Receives every new assignment.
    fn subscribe(&self) -> watch::Receiver<PartitionAssignment>;

    /// Counts one processed key towards the reported workload.
    fn record_processed(&self) {}
}

/// A fixed assignment, replaceable by hand.
pub struct StaticMembership {
    tx: watch::Sender<PartitionAssignment>,
}

impl StaticMembership {
    pub fn new(assignment: PartitionAssignment) -> Self {
        let (tx, _) = watch::channel(assignment);
        Self { tx }
    }

    pub fn whole() -> Self {
        Self::new(PartitionAssignment::whole())
    }

    pub fn set(&self, assignment: PartitionAssignment) {
        self.tx.send_replace(assignment);
    }
}

impl PartitionMembership for StaticMembership {
    fn current(&self) -> PartitionAssignment {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<PartitionAssignment> {
        self.tx.subscribe()
    }
}
