// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::ops::RangeInclusive;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha512};

use crate::{
    error::{Error, Result},
    ids::{AccountId, MessageHash, MESSAGE_HASH_SIZE},
};

/// Maximum accepted message body, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 76_800;

/// Default upper bound on `expiry_ms - timestamp_ms`.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Per-namespace-class retention bounds.  Lookup takes the first matching
/// range; namespaces not covered fall back to [`DEFAULT_RETENTION`].
#[derive(Debug, Clone)]
pub struct RetentionTable {
    entries: Vec<(RangeInclusive<i16>, Duration)>,
}

impl Default for RetentionTable {
    fn default() -> Self {
        Self {
            entries: vec![(i16::MIN..=i16::MAX, DEFAULT_RETENTION)],
        }
    }
}

impl RetentionTable {
    pub fn new(entries: Vec<(RangeInclusive<i16>, Duration)>) -> Self {
        Self { entries }
    }

    pub fn max_ttl(&self, namespace: i16) -> Duration {
        self.entries
            .iter()
            .find(|(range, _)| range.contains(&namespace))
            .map(|(_, ttl)| *ttl)
            .unwrap_or(DEFAULT_RETENTION)
    }

    /// Largest TTL any entry allows.  Used where one account-wide bound is
    /// needed, e.g. capping expiry extension over hashes that may span
    /// namespaces.
    pub fn max_ttl_any(&self) -> Duration {
        self.entries
            .iter()
            .map(|(_, ttl)| *ttl)
            .max()
            .unwrap_or(DEFAULT_RETENTION)
    }
}

/// A single stored payload.  Never mutated after a successful store; expiry
/// extension replaces the expiry field keyed by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub account: AccountId,
    pub namespace: i16,
    pub hash: MessageHash,
    pub data: Vec<u8>,
    pub timestamp_ms: i64,
    pub expiry_ms: i64,
}

impl Message {
    pub fn new(
        account: AccountId,
        namespace: i16,
        data: Vec<u8>,
        timestamp_ms: i64,
        expiry_ms: i64,
    ) -> Self {
        let hash = compute_hash(&account, namespace, timestamp_ms, &data);
        Self {
            account,
            namespace,
            hash,
            data,
            timestamp_ms,
            expiry_ms,
        }
    }

    /// Check the size and time invariants against the injected retention
    /// bounds.  `now_ms` is taken as a parameter so callers (and tests)
    /// control the clock.
    pub fn validate(&self, retention: &RetentionTable) -> Result<()> {
        if self.data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::PayloadTooLarge {
                size: self.data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        if self.timestamp_ms >= self.expiry_ms {
            return Err(Error::InvalidTimestamp(
                "expiry must be after the message timestamp".into(),
            ));
        }
        let max_ttl_ms = retention.max_ttl(self.namespace).as_millis() as i64;
        if self.expiry_ms - self.timestamp_ms > max_ttl_ms {
            return Err(Error::InvalidTimestamp(format!(
                "ttl exceeds the {max_ttl_ms} ms bound for namespace {}",
                self.namespace
            )));
        }
        Ok(())
    }
}

/// Message content digest: the first 32 bytes of
/// `SHA-512(account || namespace || timestamp_ms || data)` with the
/// namespace and timestamp as base-10 ASCII.  The namespace component is
/// omitted for namespace 0 so default-namespace hashes match deployments
/// that predate namespacing.
pub fn compute_hash(
    account: &AccountId,
    namespace: i16,
    timestamp_ms: i64,
    data: &[u8],
) -> MessageHash {
    let mut hasher = Sha512::new();
    hasher.update(account.0);
    if namespace != 0 {
        hasher.update(namespace.to_string().as_bytes());
    }
    hasher.update(timestamp_ms.to_string().as_bytes());
    hasher.update(data);
    let digest = hasher.finalize();
    let mut hash = [0u8; MESSAGE_HASH_SIZE];
    hash.copy_from_slice(&digest[..MESSAGE_HASH_SIZE]);
    MessageHash(hash)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
