// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use curve25519_dalek::{edwards::CompressedEdwardsY, Scalar};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha512};

use crate::{
    error::{Error, Result},
    ids::{AccountId, MessageHash, NetworkParams, SESSION_PREFIX},
};

/// Signature timestamps older than this are rejected.
pub const SIGNATURE_MAX_AGE_SECS: i64 = 14 * 24 * 60 * 60;
/// Signature timestamps further in the future than this are rejected.
pub const SIGNATURE_MAX_FUTURE_SECS: i64 = 24 * 60 * 60;

/// Signed material accompanying an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthCredentials {
    pub account: AccountId,
    /// Underlying Ed25519 pubkey for session accounts whose id is
    /// X25519-derived; unused for direct Ed25519 accounts.
    pub ed_pubkey: Option<[u8; 32]>,
    /// Delegated-authorization subkey tweak.
    pub subkey: Option<[u8; 32]>,
    pub signature: [u8; 64],
    pub timestamp_s: i64,
}

/// Verifies account signatures on authenticated requests, either with the
/// account's master key directly or through a derived subkey.
#[derive(Debug, Clone, Copy)]
pub struct Authenticator {
    network: NetworkParams,
}

impl Authenticator {
    pub fn new(network: NetworkParams) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &NetworkParams {
        &self.network
    }

    /// Verify `signature` over the method's canonical string.  All
    /// cryptographic failure modes collapse into `invalid_signature`;
    /// malformed keys and stale timestamps keep their own kinds.
    pub fn verify(&self, creds: &AuthCredentials, canonical: &[u8], now_s: i64) -> Result<()> {
        if now_s - creds.timestamp_s > SIGNATURE_MAX_AGE_SECS {
            return Err(Error::InvalidTimestamp("signature timestamp too old".into()));
        }
        if creds.timestamp_s - now_s > SIGNATURE_MAX_FUTURE_SECS {
            return Err(Error::InvalidTimestamp(
                "signature timestamp in the future".into(),
            ));
        }

        let master = self.resolve_master_key(creds)?;
        let key = match &creds.subkey {
            Some(subkey) => derive_subkey_pubkey(&master, subkey)?,
            None => VerifyingKey::from_bytes(&master)
                .map_err(|_| Error::InvalidPubkey("account key is not a valid point".into()))?,
        };
        let signature = Signature::from_bytes(&creds.signature);
        key.verify(canonical, &signature)
            .map_err(|_| Error::InvalidSignature)
    }

    /// The Ed25519 key that anchors verification.  Session accounts carry
    /// an X25519-derived id, so the caller supplies the underlying Ed25519
    /// key and we check it converts to the claimed account.
    fn resolve_master_key(&self, creds: &AuthCredentials) -> Result<[u8; 32]> {
        if creds.account.prefix() == SESSION_PREFIX {
            let ed_pubkey = creds.ed_pubkey.ok_or_else(|| {
                Error::InvalidPubkey("session accounts require the underlying ed25519 key".into())
            })?;
            let vk = VerifyingKey::from_bytes(&ed_pubkey)
                .map_err(|_| Error::InvalidPubkey("ed25519 key is not a valid point".into()))?;
            let derived_x = vk.to_montgomery().to_bytes();
            if derived_x != creds.account.key() {
                return Err(Error::InvalidPubkey(
                    "ed25519 key does not derive the claimed account".into(),
                ));
            }
            Ok(ed_pubkey)
        } else {
            let mut master = [0u8; 32];
            master.copy_from_slice(creds.account.key());
            Ok(master)
        }
    }
}

/// Effective verification key for subkey-delegated requests:
/// `D = (1 + t)·A` with `t = SHA-512(subkey ‖ A)` reduced mod the group
/// order.  The tweak binds the subkey to this specific master key.
fn derive_subkey_pubkey(master: &[u8; 32], subkey: &[u8; 32]) -> Result<VerifyingKey> {
    let point = CompressedEdwardsY(*master)
        .decompress()
        .ok_or_else(|| Error::InvalidPubkey("account key is not a valid point".into()))?;
    let mut hasher = Sha512::new();
    hasher.update(subkey);
    hasher.update(master);
    let wide: [u8; 64] = hasher.finalize().into();
    let tweak = Scalar::from_bytes_mod_order_wide(&wide);
    let derived = point * (Scalar::ONE + tweak);
    VerifyingKey::from_bytes(&derived.compress().to_bytes()).map_err(|_| Error::InvalidSignature)
}

/// Canonical signed strings, one per authenticated method.  Integers are
/// base-10 ASCII; the account is the lower-case hex of the 33-byte id.
pub mod canonical {
    use super::{AccountId, MessageHash};

    pub fn store(account: &AccountId, namespace: i16, timestamp_s: i64) -> Vec<u8> {
        format!("store{}{}{}", account.to_hex(), namespace, timestamp_s).into_bytes()
    }

    pub fn retrieve(account: &AccountId, namespace: i16, timestamp_s: i64) -> Vec<u8> {
        format!("retrieve{}{}{}", account.to_hex(), namespace, timestamp_s).into_bytes()
    }

    pub fn delete(account: &AccountId, timestamp_s: i64, hashes: &[MessageHash]) -> Vec<u8> {
        let mut out = format!("delete{}{}", account.to_hex(), timestamp_s);
        for hash in hashes {
            out.push_str(&hash.to_hex());
        }
        out.into_bytes()
    }

    pub fn delete_all(
        account: &AccountId,
        namespace: Option<i16>,
        before_ms: i64,
        timestamp_s: i64,
    ) -> Vec<u8> {
        let ns = namespace.map_or_else(|| "all".to_owned(), |ns| ns.to_string());
        format!(
            "delete_all{}{}{}{}",
            account.to_hex(),
            ns,
            before_ms,
            timestamp_s
        )
        .into_bytes()
    }

    pub fn expire(
        account: &AccountId,
        expiry_ms: i64,
        timestamp_s: i64,
        hashes: &[MessageHash],
    ) -> Vec<u8> {
        let mut out = format!("expire{}{}{}", account.to_hex(), expiry_ms, timestamp_s);
        for hash in hashes {
            out.push_str(&hash.to_hex());
        }
        out.into_bytes()
    }

    pub fn monitor(
        account: &AccountId,
        timestamp_s: i64,
        want_data: bool,
        namespaces: &[i16],
    ) -> Vec<u8> {
        let ns = namespaces
            .iter()
            .map(|ns| ns.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "MONITOR{}{}{}{}",
            account.to_hex(),
            timestamp_s,
            if want_data { "1" } else { "0" },
            ns
        )
        .into_bytes()
    }
}
