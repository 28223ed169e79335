// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::{
    ids::NetworkParams,
    message::RetentionTable,
    rate_limit::{ACCOUNT_PER_MINUTE, PUBLIC_PER_MINUTE},
    store::PAGE_LIMIT,
};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub db_path: PathBuf,
    pub network: NetworkParams,
    pub page_limit: u64,
    pub retention: RetentionTable,
    pub bind_http: Option<SocketAddr>,
    /// Node software version advertised through `info`.
    pub version: [u16; 3],
    /// Current hard-fork level advertised through `info`.
    pub hardfork: u16,
    pub public_rate_per_minute: u32,
    pub account_rate_per_minute: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("swarmstore.db"),
            network: NetworkParams::mainnet(),
            page_limit: PAGE_LIMIT,
            retention: RetentionTable::default(),
            bind_http: Some("0.0.0.0:22021".parse().expect("valid socket")),
            version: [0, 3, 0],
            hardfork: 19,
            public_rate_per_minute: PUBLIC_PER_MINUTE,
            account_rate_per_minute: ACCOUNT_PER_MINUTE,
        }
    }
}
