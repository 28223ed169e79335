// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ACCOUNT_ID_SIZE: usize = 33;
pub const MESSAGE_HASH_SIZE: usize = 32;

/// Network prefix byte for session-style accounts whose key material is
/// X25519-derived rather than a direct Ed25519 key.
pub const SESSION_PREFIX: u8 = 0x05;

/// Per-network parameters threaded through construction.  Replaces any
/// process-global "is mainnet" flag: every length or prefix check consults
/// this value locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkParams {
    /// Expected network prefix byte on account identifiers.
    pub prefix: u8,
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        Self {
            prefix: SESSION_PREFIX,
        }
    }

    pub fn testnet() -> Self {
        Self { prefix: 0x00 }
    }

    /// Length of an account id in lower-case hex.
    pub fn account_hex_len(&self) -> usize {
        ACCOUNT_ID_SIZE * 2
    }
}

/// 33-byte account identifier: 1-byte network prefix + 32-byte key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub [u8; ACCOUNT_ID_SIZE]);

impl AccountId {
    pub fn from_bytes(bytes: &[u8], network: &NetworkParams) -> Result<Self> {
        if bytes.len() != ACCOUNT_ID_SIZE {
            return Err(Error::InvalidPubkey(format!(
                "expected {ACCOUNT_ID_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0] != network.prefix {
            return Err(Error::InvalidPubkey(format!(
                "wrong network prefix 0x{:02x}",
                bytes[0]
            )));
        }
        let mut id = [0u8; ACCOUNT_ID_SIZE];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn from_hex(hex_str: &str, network: &NetworkParams) -> Result<Self> {
        if hex_str.len() != network.account_hex_len() {
            return Err(Error::InvalidPubkey(format!(
                "expected {} hex chars, got {}",
                network.account_hex_len(),
                hex_str.len()
            )));
        }
        let bytes = hex::decode(hex_str)
            .map_err(|_| Error::InvalidPubkey("account id is not valid hex".into()))?;
        Self::from_bytes(&bytes, network)
    }

    /// The network prefix byte.
    pub fn prefix(&self) -> u8 {
        self.0[0]
    }

    /// The 32-byte key portion, prefix stripped.
    pub fn key(&self) -> &[u8] {
        &self.0[1..]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Value on the u64 ring used for swarm assignment, derived from the
    /// leading key bytes (prefix excluded).
    pub fn ring_value(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[1..9]);
        u64::from_be_bytes(raw)
    }
}

/// 32-byte message content digest; primary key within the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageHash(pub [u8; MESSAGE_HASH_SIZE]);

impl MessageHash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != MESSAGE_HASH_SIZE {
            return Err(Error::BadRequest(format!(
                "message hash must be {MESSAGE_HASH_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut hash = [0u8; MESSAGE_HASH_SIZE];
        hash.copy_from_slice(bytes);
        Ok(Self(hash))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|_| Error::BadRequest("message hash is not valid hex".into()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Validate a namespace list for monitor-style requests: sorted, unique,
/// non-empty.  Any i16 value is an acceptable namespace on its own.
pub fn check_namespace_list(namespaces: &[i16]) -> Result<()> {
    if namespaces.is_empty() {
        return Err(Error::InvalidNamespace("empty namespace list".into()));
    }
    for pair in namespaces.windows(2) {
        if pair[0] >= pair[1] {
            return Err(Error::InvalidNamespace(
                "namespaces must be sorted and unique".into(),
            ));
        }
    }
    Ok(())
}
