// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use thiserror::Error;

use crate::swarm::SwarmId;

pub type Result<T> = std::result::Result<T, Error>;

/// Request-visible failure kinds.  Everything a caller can observe maps to
/// one of these; storage internals that are not `Duplicate` or
/// `CapacityExceeded` are logged and folded into `Internal`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid pubkey: {0}")]
    InvalidPubkey(String),

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("account belongs to swarm {swarm_id}")]
    WrongSwarm { swarm_id: SwarmId },

    #[error("payload too large: {size} > {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("storage capacity exceeded")]
    CapacityExceeded,

    #[error("duplicate message hash")]
    Duplicate,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable kind, stable across versions.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "bad_request",
            Error::InvalidPubkey(_) => "invalid_pubkey",
            Error::InvalidNamespace(_) => "invalid_namespace",
            Error::InvalidTimestamp(_) => "invalid_timestamp",
            Error::InvalidSignature => "invalid_signature",
            Error::WrongSwarm { .. } => "wrong_swarm",
            Error::PayloadTooLarge { .. } => "payload_too_large",
            Error::CapacityExceeded => "capacity_exceeded",
            Error::Duplicate => "duplicate",
            Error::NotFound(_) => "not_found",
            Error::RateLimited => "rate_limited",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Status code used by the HTTP surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::InvalidPubkey(_)
            | Error::InvalidNamespace(_)
            | Error::InvalidTimestamp(_)
            | Error::InvalidSignature => 401,
            Error::PayloadTooLarge { .. } => 413,
            Error::WrongSwarm { .. } => 421,
            Error::Duplicate => 409,
            Error::NotFound(_) => 404,
            Error::RateLimited => 429,
            Error::CapacityExceeded => 507,
            Error::Internal(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Internal(format!("database: {err}"))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("storage worker: {err}"))
    }
}
