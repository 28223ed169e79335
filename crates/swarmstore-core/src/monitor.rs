// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use crate::{
    auth::{canonical, AuthCredentials, Authenticator},
    bt,
    error::Error,
    ids::{check_namespace_list, AccountId, ACCOUNT_ID_SIZE, SESSION_PREFIX},
    message::Message,
    swarm::SwarmRouter,
};

/// Subscriptions live this long; clients are expected to re-subscribe
/// within the hour.
pub const MONITOR_EXPIRY: Duration = Duration::from_secs(65 * 60);

/// Destination for push notifications.  The transport keeps a bounded
/// outbound buffer; a send that cannot be queued reports `false` and the
/// notification is dropped.
pub trait NotifySink: Send + Sync {
    /// Stable identity of the subscriber connection; used to coalesce
    /// re-subscriptions.
    fn connection_id(&self) -> u64;

    /// Best-effort push of one `notify.message` envelope.
    fn send_notification(&self, envelope: &[u8]) -> bool;
}

struct Subscription {
    namespaces: Vec<i16>,
    want_data: bool,
    expiry: Instant,
    sink: Arc<dyn NotifySink>,
}

/// Per-entry subscription failure codes, fixed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    BadArgs = 1,
    BadPubkey = 2,
    BadNamespace = 3,
    BadTimestamp = 4,
    BadSignature = 5,
    WrongSwarm = 6,
}

impl MonitorError {
    fn detail(self) -> &'static str {
        match self {
            MonitorError::BadArgs => "invalid arguments",
            MonitorError::BadPubkey => "invalid pubkey",
            MonitorError::BadNamespace => "invalid namespace",
            MonitorError::BadTimestamp => "invalid timestamp",
            MonitorError::BadSignature => "signature verification failed",
            MonitorError::WrongSwarm => "pubkey is not stored by this swarm",
        }
    }
}

/// Maintains push subscriptions and fans out notifications on new
/// messages.  Reads (one per store) dominate writes, hence the
/// reader-writer lock.
pub struct MonitorRegistry {
    subscriptions: RwLock<HashMap<AccountId, Vec<Subscription>>>,
}

impl MonitorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
        })
    }

    /// Register (or refresh) a subscription.  An entry with the same
    /// connection, namespaces and data flag only has its expiry reset.
    pub fn subscribe(
        &self,
        account: AccountId,
        namespaces: Vec<i16>,
        want_data: bool,
        sink: Arc<dyn NotifySink>,
        now: Instant,
    ) {
        let mut map = self.subscriptions.write().expect("monitor lock");
        let entries = map.entry(account).or_default();
        if let Some(existing) = entries.iter_mut().find(|sub| {
            sub.sink.connection_id() == sink.connection_id()
                && sub.namespaces == namespaces
                && sub.want_data == want_data
        }) {
            existing.expiry = now + MONITOR_EXPIRY;
            existing.sink = sink;
            return;
        }
        entries.push(Subscription {
            namespaces,
            want_data,
            expiry: now + MONITOR_EXPIRY,
            sink,
        });
    }

    /// Push `notify.message` envelopes to every live subscription matching
    /// the message's account and namespace.  Send failures drop the single
    /// notification; the subscription stays.  Returns the number of
    /// envelopes handed to sinks.
    pub fn notify(&self, message: &Message, now: Instant) -> usize {
        let map = self.subscriptions.read().expect("monitor lock");
        let Some(entries) = map.get(&message.account) else {
            return 0;
        };
        let mut sent = 0;
        let mut with_data: Option<Vec<u8>> = None;
        let mut without_data: Option<Vec<u8>> = None;
        for sub in entries {
            if sub.expiry <= now || sub.namespaces.binary_search(&message.namespace).is_err() {
                continue;
            }
            let envelope = if sub.want_data {
                with_data.get_or_insert_with(|| encode_envelope(message, true))
            } else {
                without_data.get_or_insert_with(|| encode_envelope(message, false))
            };
            if sub.sink.send_notification(envelope) {
                sent += 1;
            } else {
                tracing::debug!(
                    account = %message.account.to_hex(),
                    namespace = message.namespace,
                    "dropped notification: send failed"
                );
            }
        }
        sent
    }

    /// Drop expired subscriptions; called opportunistically and from the
    /// periodic cleaner.
    pub fn prune_expired(&self, now: Instant) {
        let mut map = self.subscriptions.write().expect("monitor lock");
        map.retain(|_, entries| {
            entries.retain(|sub| sub.expiry > now);
            !entries.is_empty()
        });
    }

    /// Drop every subscription attached to a closed connection.
    pub fn remove_connection(&self, connection_id: u64) {
        let mut map = self.subscriptions.write().expect("monitor lock");
        map.retain(|_, entries| {
            entries.retain(|sub| sub.sink.connection_id() != connection_id);
            !entries.is_empty()
        });
    }

    #[cfg(test)]
    fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .expect("monitor lock")
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Bencoded `notify.message` payload.  Keys in ASCII order:
/// `@` account (33 bytes), `h` hash (32), `n` namespace, `t` timestamp ms,
/// `z` expiry ms, and `~d` data only when the subscriber asked for it.
fn encode_envelope(message: &Message, want_data: bool) -> Vec<u8> {
    let mut dict = BTreeMap::new();
    dict.insert(b"@".to_vec(), bt::Value::Bytes(message.account.0.to_vec()));
    dict.insert(b"h".to_vec(), bt::Value::Bytes(message.hash.0.to_vec()));
    dict.insert(b"n".to_vec(), bt::Value::Int(i64::from(message.namespace)));
    dict.insert(b"t".to_vec(), bt::Value::Int(message.timestamp_ms));
    dict.insert(b"z".to_vec(), bt::Value::Int(message.expiry_ms));
    if want_data {
        dict.insert(b"~d".to_vec(), bt::Value::Bytes(message.data.clone()));
    }
    bt::encode(&bt::Value::Dict(dict))
}

/// Handle a `monitor.messages` request body: a bencoded dict or list of
/// dicts.  The reply mirrors the request shape, one outcome per entry.
pub fn handle_monitor_request(
    body: &bt::Value,
    registry: &MonitorRegistry,
    auth: &Authenticator,
    router: &SwarmRouter,
    sink: Arc<dyn NotifySink>,
    now_s: i64,
    now: Instant,
) -> bt::Value {
    match body {
        bt::Value::Dict(_) => {
            subscription_outcome(body, registry, auth, router, sink, now_s, now)
        }
        bt::Value::List(entries) => bt::Value::List(
            entries
                .iter()
                .map(|entry| {
                    subscription_outcome(entry, registry, auth, router, sink.clone(), now_s, now)
                })
                .collect(),
        ),
        _ => error_value(MonitorError::BadArgs),
    }
}

fn subscription_outcome(
    entry: &bt::Value,
    registry: &MonitorRegistry,
    auth: &Authenticator,
    router: &SwarmRouter,
    sink: Arc<dyn NotifySink>,
    now_s: i64,
    now: Instant,
) -> bt::Value {
    match process_subscription(entry, registry, auth, router, sink, now_s, now) {
        Ok(()) => {
            let mut dict = BTreeMap::new();
            dict.insert(b"success".to_vec(), bt::Value::Int(1));
            bt::Value::Dict(dict)
        }
        Err(code) => error_value(code),
    }
}

fn error_value(code: MonitorError) -> bt::Value {
    let mut dict = BTreeMap::new();
    dict.insert(b"errcode".to_vec(), bt::Value::Int(code as i64));
    dict.insert(b"error".to_vec(), bt::Value::bytes(code.detail()));
    bt::Value::Dict(dict)
}

fn process_subscription(
    entry: &bt::Value,
    registry: &MonitorRegistry,
    auth: &Authenticator,
    router: &SwarmRouter,
    sink: Arc<dyn NotifySink>,
    now_s: i64,
    now: Instant,
) -> std::result::Result<(), MonitorError> {
    let dict = entry.as_dict().ok_or(MonitorError::BadArgs)?;

    // Exactly one of `p` (full 33-byte account) or `P` (underlying ed25519
    // key of a session account).
    let account_field = dict.get(b"p".as_slice());
    let ed_field = dict.get(b"P".as_slice());
    let (account, ed_pubkey) = match (account_field, ed_field) {
        (Some(value), None) => {
            let raw = value.as_bytes().ok_or(MonitorError::BadArgs)?;
            let account = AccountId::from_bytes(raw, auth.network())
                .map_err(|_| MonitorError::BadPubkey)?;
            (account, None)
        }
        (None, Some(value)) => {
            let raw = value.as_bytes().ok_or(MonitorError::BadArgs)?;
            let ed: [u8; 32] = raw.try_into().map_err(|_| MonitorError::BadPubkey)?;
            let vk = ed25519_dalek::VerifyingKey::from_bytes(&ed)
                .map_err(|_| MonitorError::BadPubkey)?;
            let mut raw_account = [0u8; ACCOUNT_ID_SIZE];
            raw_account[0] = SESSION_PREFIX;
            raw_account[1..].copy_from_slice(&vk.to_montgomery().to_bytes());
            (AccountId(raw_account), Some(ed))
        }
        _ => return Err(MonitorError::BadArgs),
    };

    let subkey = match dict.get(b"S".as_slice()) {
        Some(value) => {
            let raw = value.as_bytes().ok_or(MonitorError::BadArgs)?;
            Some(<[u8; 32]>::try_from(raw).map_err(|_| MonitorError::BadArgs)?)
        }
        None => None,
    };

    let namespaces: Vec<i16> = dict
        .get(b"n".as_slice())
        .and_then(bt::Value::as_list)
        .ok_or(MonitorError::BadArgs)?
        .iter()
        .map(|value| {
            value
                .as_int()
                .and_then(|ns| i16::try_from(ns).ok())
                .ok_or(MonitorError::BadNamespace)
        })
        .collect::<std::result::Result<_, _>>()?;
    check_namespace_list(&namespaces).map_err(|_| MonitorError::BadNamespace)?;

    let want_data = match dict.get(b"d".as_slice()) {
        Some(value) => value.as_int().ok_or(MonitorError::BadArgs)? != 0,
        None => false,
    };
    let timestamp_s = dict
        .get(b"t".as_slice())
        .and_then(bt::Value::as_int)
        .ok_or(MonitorError::BadTimestamp)?;
    let signature: [u8; 64] = dict
        .get(b"s".as_slice())
        .and_then(bt::Value::as_bytes)
        .and_then(|raw| raw.try_into().ok())
        .ok_or(MonitorError::BadArgs)?;

    let creds = AuthCredentials {
        account,
        ed_pubkey,
        subkey,
        signature,
        timestamp_s,
    };
    let signed = canonical::monitor(&account, timestamp_s, want_data, &namespaces);
    auth.verify(&creds, &signed, now_s).map_err(|err| match err {
        Error::InvalidTimestamp(_) => MonitorError::BadTimestamp,
        Error::InvalidPubkey(_) => MonitorError::BadPubkey,
        _ => MonitorError::BadSignature,
    })?;

    if !router.is_local(&account) {
        return Err(MonitorError::WrongSwarm);
    }

    registry.subscribe(account, namespaces, want_data, sink, now);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NetworkParams;
    use crate::swarm::{single_node_snapshot, NodeRecord, SwarmRouter};
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingSink {
        id: u64,
        accept: bool,
        envelopes: Mutex<Vec<Vec<u8>>>,
        attempts: AtomicUsize,
    }

    impl RecordingSink {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                accept: true,
                envelopes: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
            })
        }

        fn rejecting(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                accept: false,
                envelopes: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
            })
        }
    }

    impl NotifySink for RecordingSink {
        fn connection_id(&self) -> u64 {
            self.id
        }

        fn send_notification(&self, envelope: &[u8]) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                self.envelopes
                    .lock()
                    .expect("sink lock")
                    .push(envelope.to_vec());
            }
            self.accept
        }
    }

    fn account(tag: u8) -> AccountId {
        let mut raw = [0u8; ACCOUNT_ID_SIZE];
        raw[0] = SESSION_PREFIX;
        raw[1] = tag;
        AccountId(raw)
    }

    fn message(tag: u8, namespace: i16) -> Message {
        Message::new(
            account(tag),
            namespace,
            b"hi".to_vec(),
            1_700_000_000_000,
            1_700_000_100_000,
        )
    }

    #[test]
    fn notify_matches_account_and_namespace() {
        let registry = MonitorRegistry::new();
        let sink = RecordingSink::new(1);
        let now = Instant::now();
        registry.subscribe(account(1), vec![0, 1], true, sink.clone(), now);

        assert_eq!(registry.notify(&message(1, 0), now), 1);
        assert_eq!(registry.notify(&message(1, 2), now), 0);
        assert_eq!(registry.notify(&message(2, 0), now), 0);
        assert_eq!(sink.envelopes.lock().expect("sink lock").len(), 1);
    }

    #[test]
    fn envelope_layout_is_sorted_and_optional_data() {
        let msg = message(1, 0);
        let envelope = encode_envelope(&msg, true);
        let decoded = bt::decode(&envelope).expect("decode envelope");
        let dict = decoded.as_dict().expect("dict");
        let keys: Vec<&[u8]> = dict.keys().map(Vec::as_slice).collect();
        assert_eq!(
            keys,
            vec![
                b"@".as_slice(),
                b"h".as_slice(),
                b"n".as_slice(),
                b"t".as_slice(),
                b"z".as_slice(),
                b"~d".as_slice(),
            ]
        );
        assert_eq!(
            dict.get(b"~d".as_slice()).and_then(bt::Value::as_bytes),
            Some(b"hi".as_slice())
        );

        let bare = bt::decode(&encode_envelope(&msg, false)).expect("decode");
        assert!(bare.as_dict().expect("dict").get(b"~d".as_slice()).is_none());
    }

    #[test]
    fn resubscription_coalesces_and_resets_expiry() {
        let registry = MonitorRegistry::new();
        let sink = RecordingSink::new(1);
        let now = Instant::now();
        registry.subscribe(account(1), vec![0], true, sink.clone(), now);
        registry.subscribe(account(1), vec![0], true, sink.clone(), now);
        assert_eq!(registry.subscription_count(), 1);

        // Exactly one envelope per store even after re-subscribing.
        assert_eq!(registry.notify(&message(1, 0), now), 1);

        // Different namespace set is a separate subscription.
        registry.subscribe(account(1), vec![0, 1], true, sink, now);
        assert_eq!(registry.subscription_count(), 2);
    }

    #[test]
    fn expired_subscriptions_get_no_notifications_and_prune() {
        let registry = MonitorRegistry::new();
        let sink = RecordingSink::new(1);
        let now = Instant::now();
        registry.subscribe(account(1), vec![0], false, sink, now);

        let later = now + MONITOR_EXPIRY + Duration::from_secs(1);
        assert_eq!(registry.notify(&message(1, 0), later), 0);
        registry.prune_expired(later);
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn send_failure_drops_notification_but_keeps_subscription() {
        let registry = MonitorRegistry::new();
        let sink = RecordingSink::rejecting(1);
        let now = Instant::now();
        registry.subscribe(account(1), vec![0], false, sink.clone(), now);

        assert_eq!(registry.notify(&message(1, 0), now), 0);
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn remove_connection_drops_all_its_subscriptions() {
        let registry = MonitorRegistry::new();
        let now = Instant::now();
        registry.subscribe(account(1), vec![0], false, RecordingSink::new(1), now);
        registry.subscribe(account(2), vec![0], false, RecordingSink::new(1), now);
        registry.subscribe(account(1), vec![1], false, RecordingSink::new(2), now);

        registry.remove_connection(1);
        assert_eq!(registry.subscription_count(), 1);
    }

    fn signed_entry(key: &SigningKey, namespaces: &[i64], want_data: bool, now_s: i64) -> bt::Value {
        let x25519 = key.verifying_key().to_montgomery().to_bytes();
        let mut raw = [0u8; ACCOUNT_ID_SIZE];
        raw[0] = SESSION_PREFIX;
        raw[1..].copy_from_slice(&x25519);
        let account = AccountId(raw);
        let ns_i16: Vec<i16> = namespaces.iter().map(|ns| *ns as i16).collect();
        let signed = canonical::monitor(&account, now_s, want_data, &ns_i16);
        let signature = key.sign(&signed).to_bytes();

        let mut dict = BTreeMap::new();
        dict.insert(
            b"P".to_vec(),
            bt::Value::Bytes(key.verifying_key().to_bytes().to_vec()),
        );
        dict.insert(
            b"n".to_vec(),
            bt::Value::List(namespaces.iter().map(|ns| bt::Value::Int(*ns)).collect()),
        );
        if want_data {
            dict.insert(b"d".to_vec(), bt::Value::Int(1));
        }
        dict.insert(b"t".to_vec(), bt::Value::Int(now_s));
        dict.insert(b"s".to_vec(), bt::Value::Bytes(signature.to_vec()));
        bt::Value::Dict(dict)
    }

    fn test_router() -> Arc<SwarmRouter> {
        SwarmRouter::new(single_node_snapshot(NodeRecord {
            address: "127.0.0.1".into(),
            port: 22_021,
            pubkey: [0u8; 32],
        }))
    }

    #[test]
    fn monitor_request_subscribes_on_valid_signature() {
        let registry = MonitorRegistry::new();
        let auth = Authenticator::new(NetworkParams::mainnet());
        let router = test_router();
        let key = SigningKey::generate(&mut OsRng);
        let now_s = 1_700_000_000;

        let entry = signed_entry(&key, &[0, 1], true, now_s);
        let reply = handle_monitor_request(
            &entry,
            &registry,
            &auth,
            &router,
            RecordingSink::new(1),
            now_s,
            Instant::now(),
        );
        let dict = reply.as_dict().expect("dict reply");
        assert_eq!(
            dict.get(b"success".as_slice()).and_then(bt::Value::as_int),
            Some(1)
        );
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn monitor_request_list_mirrors_shape_and_codes() {
        let registry = MonitorRegistry::new();
        let auth = Authenticator::new(NetworkParams::mainnet());
        let router = test_router();
        let key = SigningKey::generate(&mut OsRng);
        let now_s = 1_700_000_000;

        let good = signed_entry(&key, &[0], false, now_s);
        // Unsorted namespaces fail with code 3 before any signature check.
        let mut bad = signed_entry(&key, &[1, 0], false, now_s);
        if let bt::Value::Dict(dict) = &mut bad {
            dict.remove(b"s".as_slice());
            dict.insert(b"s".to_vec(), bt::Value::Bytes(vec![0u8; 64]));
        }

        let reply = handle_monitor_request(
            &bt::Value::List(vec![good, bad]),
            &registry,
            &auth,
            &router,
            RecordingSink::new(1),
            now_s,
            Instant::now(),
        );
        let list = reply.as_list().expect("list reply");
        assert_eq!(list.len(), 2);
        assert!(list[0]
            .as_dict()
            .expect("dict")
            .contains_key(b"success".as_slice()));
        assert_eq!(
            list[1]
                .as_dict()
                .expect("dict")
                .get(b"errcode".as_slice())
                .and_then(bt::Value::as_int),
            Some(MonitorError::BadNamespace as i64)
        );
    }

    #[test]
    fn monitor_request_rejects_bad_signature() {
        let registry = MonitorRegistry::new();
        let auth = Authenticator::new(NetworkParams::mainnet());
        let router = test_router();
        let key = SigningKey::generate(&mut OsRng);
        let now_s = 1_700_000_000;

        let mut entry = signed_entry(&key, &[0], false, now_s);
        if let bt::Value::Dict(dict) = &mut entry {
            dict.insert(b"s".to_vec(), bt::Value::Bytes(vec![0u8; 64]));
        }
        let reply = handle_monitor_request(
            &entry,
            &registry,
            &auth,
            &router,
            RecordingSink::new(1),
            now_s,
            Instant::now(),
        );
        assert_eq!(
            reply
                .as_dict()
                .expect("dict")
                .get(b"errcode".as_slice())
                .and_then(bt::Value::as_int),
            Some(MonitorError::BadSignature as i64)
        );
        assert_eq!(registry.subscription_count(), 0);
    }
}
