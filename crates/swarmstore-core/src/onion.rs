// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Innermost onion-request envelope handling.  Outer layers are peeled by
//! the transport; this module frames the decoded payload plus the metadata
//! a peer needs to encrypt the reply.

use std::collections::BTreeMap;

use crate::{
    bt,
    error::{Error, Result},
};

/// Cipher used for the reply to the originating client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncType {
    AesGcm,
    XChaCha20,
}

impl EncType {
    fn as_str(self) -> &'static str {
        match self {
            EncType::AesGcm => "aes-gcm",
            EncType::XChaCha20 => "xchacha20",
        }
    }

    fn parse(raw: &[u8]) -> Result<Self> {
        match raw {
            b"aes-gcm" | b"gcm" => Ok(EncType::AesGcm),
            b"xchacha20" | b"xchacha20-poly1305" => Ok(EncType::XChaCha20),
            other => Err(Error::BadRequest(format!(
                "unknown onion enc type {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionMetadata {
    pub ephemeral_pubkey: [u8; 32],
    pub enc_type: EncType,
    pub hop_hint: Option<u32>,
}

/// Encode an inner payload with its metadata for the producing side.
pub fn encode(payload: &[u8], metadata: &OnionMetadata) -> Vec<u8> {
    let mut dict = BTreeMap::new();
    dict.insert(b"e".to_vec(), bt::Value::bytes(metadata.enc_type.as_str()));
    if let Some(hop) = metadata.hop_hint {
        dict.insert(b"h".to_vec(), bt::Value::Int(i64::from(hop)));
    }
    dict.insert(
        b"k".to_vec(),
        bt::Value::Bytes(metadata.ephemeral_pubkey.to_vec()),
    );
    dict.insert(b"p".to_vec(), bt::Value::Bytes(payload.to_vec()));
    bt::encode(&bt::Value::Dict(dict))
}

/// Decode an inner envelope.  Missing required fields or bad framing fail
/// with a `bad_request` kind; the payload itself stays opaque.
pub fn decode(bytes: &[u8]) -> Result<(Vec<u8>, OnionMetadata)> {
    let value = bt::decode(bytes)
        .map_err(|_| Error::BadRequest("invalid onion payload framing".into()))?;
    let dict = value
        .as_dict()
        .ok_or_else(|| Error::BadRequest("onion payload must be a dict".into()))?;

    let ephemeral_pubkey: [u8; 32] = dict
        .get(b"k".as_slice())
        .and_then(bt::Value::as_bytes)
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| Error::BadRequest("onion payload missing ephemeral key".into()))?;
    let enc_type = match dict.get(b"e".as_slice()) {
        Some(value) => EncType::parse(
            value
                .as_bytes()
                .ok_or_else(|| Error::BadRequest("onion enc type must be a string".into()))?,
        )?,
        None => EncType::AesGcm,
    };
    let hop_hint = match dict.get(b"h".as_slice()) {
        Some(value) => Some(
            value
                .as_int()
                .and_then(|hop| u32::try_from(hop).ok())
                .ok_or_else(|| Error::BadRequest("onion hop hint must be an integer".into()))?,
        ),
        None => None,
    };
    let payload = dict
        .get(b"p".as_slice())
        .and_then(bt::Value::as_bytes)
        .ok_or_else(|| Error::BadRequest("onion payload missing inner body".into()))?;

    Ok((
        payload.to_vec(),
        OnionMetadata {
            ephemeral_pubkey,
            enc_type,
            hop_hint,
        },
    ))
}
