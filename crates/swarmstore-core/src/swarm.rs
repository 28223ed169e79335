// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, RwLock},
};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::{error::Result, ids::AccountId, store::MessageStore};

pub type SwarmId = u64;

/// Returned by [`SwarmSnapshot::swarm_of`] when the membership map is empty.
pub const INVALID_SWARM_ID: SwarmId = u64::MAX;

/// Outcomes kept from recent pairwise storage tests.
pub const STORAGE_TEST_WINDOW: usize = 25;

/// A peer node as reported by the membership oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub address: String,
    pub port: u16,
    pub pubkey: [u8; 32],
}

/// Immutable view of the swarm map.  The refresher builds a whole new
/// snapshot and swaps the pointer; readers observe either the old or the
/// new map, never a partial one.
#[derive(Debug, Clone, Default)]
pub struct SwarmSnapshot {
    /// Sorted swarm ids, the ring positions.
    swarm_ids: Vec<SwarmId>,
    members: HashMap<SwarmId, Vec<NodeRecord>>,
    local_swarm: SwarmId,
}

impl SwarmSnapshot {
    pub fn new(members: HashMap<SwarmId, Vec<NodeRecord>>, local_swarm: SwarmId) -> Self {
        let mut swarm_ids: Vec<SwarmId> = members.keys().copied().collect();
        swarm_ids.sort_unstable();
        Self {
            swarm_ids,
            members,
            local_swarm,
        }
    }

    pub fn local_swarm(&self) -> SwarmId {
        self.local_swarm
    }

    /// The swarm responsible for `account`: the id at the smallest
    /// circular distance from the account's ring value.
    pub fn swarm_of(&self, account: &AccountId) -> SwarmId {
        let target = account.ring_value();
        self.swarm_ids
            .iter()
            .copied()
            .min_by_key(|id| ring_distance(*id, target))
            .unwrap_or(INVALID_SWARM_ID)
    }

    pub fn peers_of(&self, swarm_id: SwarmId) -> &[NodeRecord] {
        self.members
            .get(&swarm_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn ring_distance(a: u64, b: u64) -> u64 {
    a.wrapping_sub(b).min(b.wrapping_sub(a))
}

/// Fetches a stored message from a peer for the pairwise storage test.
/// Implemented by the network-facing layer; tests inject fakes.
#[async_trait]
pub trait PeerProbe: Send + Sync {
    async fn fetch_data(&self, node: &NodeRecord, hash: &crate::ids::MessageHash)
        -> Result<Option<Vec<u8>>>;
}

/// Decides whether an account belongs to this node and tracks peer
/// reliability through the rolling storage-test window.
pub struct SwarmRouter {
    snapshot: RwLock<Arc<SwarmSnapshot>>,
    test_window: Mutex<VecDeque<bool>>,
}

impl SwarmRouter {
    pub fn new(initial: SwarmSnapshot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(initial)),
            test_window: Mutex::new(VecDeque::with_capacity(STORAGE_TEST_WINDOW)),
        })
    }

    /// Install a fresh membership snapshot from the oracle.
    pub fn update(&self, snapshot: SwarmSnapshot) {
        *self.snapshot.write().expect("swarm snapshot lock") = Arc::new(snapshot);
    }

    pub fn snapshot(&self) -> Arc<SwarmSnapshot> {
        self.snapshot.read().expect("swarm snapshot lock").clone()
    }

    pub fn swarm_of(&self, account: &AccountId) -> SwarmId {
        self.snapshot().swarm_of(account)
    }

    pub fn is_local(&self, account: &AccountId) -> bool {
        let snapshot = self.snapshot();
        snapshot.swarm_of(account) == snapshot.local_swarm()
    }

    pub fn peers_of(&self, account: &AccountId) -> Vec<NodeRecord> {
        let snapshot = self.snapshot();
        snapshot.peers_of(snapshot.swarm_of(account)).to_vec()
    }

    /// Run one pairwise storage test: ask a random local-swarm peer for a
    /// random stored message and compare the payload.  Returns `None` when
    /// there is nothing to test (no peers or empty store).
    pub async fn run_storage_test(
        &self,
        store: &MessageStore,
        probe: &dyn PeerProbe,
    ) -> Result<Option<bool>> {
        let snapshot = self.snapshot();
        let peers = snapshot.peers_of(snapshot.local_swarm()).to_vec();
        let Some(peer) = peers.choose(&mut rand::thread_rng()).cloned() else {
            return Ok(None);
        };
        let Some(message) = store.retrieve_random().await? else {
            return Ok(None);
        };

        let passed = match probe.fetch_data(&peer, &message.hash).await {
            Ok(Some(data)) => data == message.data,
            Ok(None) => false,
            Err(err) => {
                tracing::debug!(peer = %peer.address, error = %err, "storage test probe failed");
                false
            }
        };
        self.record_test_outcome(passed);
        Ok(Some(passed))
    }

    fn record_test_outcome(&self, passed: bool) {
        let mut window = self.test_window.lock().expect("test window lock");
        if window.len() == STORAGE_TEST_WINDOW {
            window.pop_front();
        }
        window.push_back(passed);
    }

    /// Fraction of recent storage tests that passed; `None` before the
    /// first test completes.
    pub fn peer_reliability(&self) -> Option<f64> {
        let window = self.test_window.lock().expect("test window lock");
        if window.is_empty() {
            return None;
        }
        let passed = window.iter().filter(|ok| **ok).count();
        Some(passed as f64 / window.len() as f64)
    }
}

/// Convenience snapshot for a standalone node that owns every account:
/// a single swarm containing only this node.
pub fn single_node_snapshot(local: NodeRecord) -> SwarmSnapshot {
    let mut members = HashMap::new();
    members.insert(0, vec![local]);
    SwarmSnapshot::new(members, 0)
}
