// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Default budget for public endpoints, keyed by request source.
pub const PUBLIC_PER_MINUTE: u32 = 600;
/// Default budget for authenticated endpoints, keyed by account.
pub const ACCOUNT_PER_MINUTE: u32 = 300;

const PRUNE_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token-bucket limiter.  Each key gets `per_minute` tokens of burst and
/// refills at the same sustained rate; an empty bucket means the request
/// is rejected without touching storage.
#[derive(Debug)]
pub struct RateLimiter {
    per_minute: f64,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    buckets: HashMap<String, Bucket>,
    pruned_at: Instant,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute: f64::from(per_minute),
            state: Mutex::new(LimiterState {
                buckets: HashMap::new(),
                pruned_at: Instant::now(),
            }),
        }
    }

    /// Take one token for `key`; `false` means over limit.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock().expect("limiter lock");
        if now.duration_since(state.pruned_at) >= PRUNE_INTERVAL {
            let per_minute = self.per_minute;
            state
                .buckets
                .retain(|_, bucket| refill(bucket, per_minute, now) < per_minute);
            state.pruned_at = now;
        }

        let bucket = state.buckets.entry(key.to_owned()).or_insert(Bucket {
            tokens: self.per_minute,
            refilled_at: now,
        });
        bucket.tokens = refill(bucket, self.per_minute, now);
        bucket.refilled_at = now;
        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }
}

fn refill(bucket: &Bucket, per_minute: f64, now: Instant) -> f64 {
    let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
    (bucket.tokens + elapsed * per_minute / 60.0).min(per_minute)
}
