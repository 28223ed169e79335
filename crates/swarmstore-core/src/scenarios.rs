// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! End-to-end flows exercising the storage, dispatch and monitor
//! subsystems together the way a client would drive them.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde_json::json;

use crate::{
    auth::canonical,
    bt,
    config::NodeConfig,
    error::{Error, Result},
    ids::{AccountId, MessageHash, ACCOUNT_ID_SIZE, SESSION_PREFIX},
    message::{now_ms, now_secs, Message},
    monitor::{handle_monitor_request, MonitorRegistry, NotifySink},
    rpc::{Encoding, Params, RedirectForwarder, Request, RequestHandler, SwarmForwarder},
    store::{DuplicateHandling, MessageStore},
    swarm::{single_node_snapshot, NodeRecord, SwarmId, SwarmRouter, SwarmSnapshot},
};

struct Fixture {
    handler: Arc<RequestHandler>,
    store: Arc<MessageStore>,
    path: PathBuf,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn fixture(tag: &str) -> Fixture {
    fixture_with(tag, Arc::new(RedirectForwarder))
}

fn fixture_with(tag: &str, forwarder: Arc<dyn SwarmForwarder>) -> Fixture {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "swarmstore_scenario_{tag}_{}.db",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("now")
            .as_nanos()
    ));
    let config = NodeConfig::default();
    let store = MessageStore::open(&path).expect("open store");
    let router = SwarmRouter::new(single_node_snapshot(NodeRecord {
        address: "127.0.0.1".into(),
        port: 22_021,
        pubkey: [0u8; 32],
    }));
    let handler = RequestHandler::new(
        &config,
        store.clone(),
        router,
        MonitorRegistry::new(),
        forwarder,
    );
    Fixture {
        handler,
        store,
        path,
    }
}

/// Stand-in for the peer relay: replies like a responsible swarm member.
struct RelayStub;

#[async_trait]
impl SwarmForwarder for RelayStub {
    async fn forward(
        &self,
        _swarm_id: SwarmId,
        _peers: Vec<NodeRecord>,
        _request: &Request,
    ) -> Result<serde_json::Value> {
        Ok(json!({ "relayed": 1 }))
    }
}

struct Client {
    key: SigningKey,
    account: AccountId,
}

impl Client {
    fn new() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let x25519 = key.verifying_key().to_montgomery().to_bytes();
        let mut raw = [0u8; ACCOUNT_ID_SIZE];
        raw[0] = SESSION_PREFIX;
        raw[1..].copy_from_slice(&x25519);
        Self {
            key,
            account: AccountId(raw),
        }
    }

    fn signed_json(&self, signed: &[u8], sig_ts: i64) -> serde_json::Value {
        json!({
            "pubkey": self.account.to_hex(),
            "pubkey_ed25519": hex::encode(self.key.verifying_key().to_bytes()),
            "sig_timestamp": sig_ts,
            "signature": base64::engine::general_purpose::STANDARD
                .encode(self.key.sign(signed).to_bytes()),
        })
    }

    fn store_request(&self, namespace: i16, data: &[u8], timestamp_ms: i64, ttl_ms: i64) -> Request {
        let sig_ts = now_secs();
        let mut params = self.signed_json(&canonical::store(&self.account, namespace, sig_ts), sig_ts);
        params["namespace"] = json!(namespace);
        params["data"] = json!(base64::engine::general_purpose::STANDARD.encode(data));
        params["timestamp"] = json!(timestamp_ms);
        params["ttl"] = json!(ttl_ms);
        Request {
            method: "store".into(),
            params: Params::Json(params),
            encoding: Encoding::Json,
            source: "scenario".into(),
            forwarded: false,
        }
    }

    fn retrieve_request(&self, namespace: i16, last_hash: Option<String>) -> Request {
        let sig_ts = now_secs();
        let mut params =
            self.signed_json(&canonical::retrieve(&self.account, namespace, sig_ts), sig_ts);
        params["namespace"] = json!(namespace);
        if let Some(hash) = last_hash {
            params["last_hash"] = json!(hash);
        }
        Request {
            method: "retrieve".into(),
            params: Params::Json(params),
            encoding: Encoding::Json,
            source: "scenario".into(),
            forwarded: false,
        }
    }

    fn monitor_entry(&self, namespaces: &[i16], want_data: bool, sig_ts: i64) -> bt::Value {
        let signed = canonical::monitor(&self.account, sig_ts, want_data, namespaces);
        let mut dict = BTreeMap::new();
        dict.insert(
            b"P".to_vec(),
            bt::Value::Bytes(self.key.verifying_key().to_bytes().to_vec()),
        );
        dict.insert(
            b"n".to_vec(),
            bt::Value::List(
                namespaces
                    .iter()
                    .map(|ns| bt::Value::Int(i64::from(*ns)))
                    .collect(),
            ),
        );
        if want_data {
            dict.insert(b"d".to_vec(), bt::Value::Int(1));
        }
        dict.insert(b"t".to_vec(), bt::Value::Int(sig_ts));
        dict.insert(
            b"s".to_vec(),
            bt::Value::Bytes(self.key.sign(&signed).to_bytes().to_vec()),
        );
        bt::Value::Dict(dict)
    }
}

struct CollectingSink {
    envelopes: Mutex<Vec<Vec<u8>>>,
}

impl CollectingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            envelopes: Mutex::new(Vec::new()),
        })
    }
}

impl NotifySink for CollectingSink {
    fn connection_id(&self) -> u64 {
        7
    }

    fn send_notification(&self, envelope: &[u8]) -> bool {
        self.envelopes
            .lock()
            .expect("sink lock")
            .push(envelope.to_vec());
        true
    }
}

// S1/S2: store yields a deterministic hash, retrieval pages past it, and a
// repeated store is a duplicate at the storage layer.
#[tokio::test]
async fn store_retrieve_and_duplicate() {
    let fx = fixture("s1");
    let client = Client::new();
    let timestamp_ms = 1_700_000_000_000;

    let stored = fx
        .handler
        .handle(&client.store_request(0, b"hello", timestamp_ms, 86_400_000))
        .await
        .expect("store");
    let hash = stored["hash"].as_str().expect("hash").to_owned();
    let expected = crate::compute_hash(&client.account, 0, timestamp_ms, b"hello");
    assert_eq!(hash, expected.to_hex());

    let reply = fx
        .handler
        .handle(&client.retrieve_request(0, None))
        .await
        .expect("retrieve");
    let messages = reply["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["hash"].as_str(), Some(hash.as_str()));

    let reply = fx
        .handler
        .handle(&client.retrieve_request(0, Some(hash)))
        .await
        .expect("retrieve since");
    assert!(reply["messages"].as_array().expect("messages").is_empty());

    // S2: the same message with the fail policy is a duplicate and the
    // count is unchanged.
    let message = Message::new(client.account, 0, b"hello".to_vec(), timestamp_ms, timestamp_ms + 86_400_000);
    let err = fx
        .store
        .store(message, DuplicateHandling::Fail)
        .await
        .expect_err("duplicate");
    assert!(matches!(err, Error::Duplicate));
    assert_eq!(fx.store.get_stats().await.expect("stats").message_count, 1);
}

// S3: a 1 ms ttl message disappears after one cleanup cycle.
#[tokio::test]
async fn expiry_cleanup_cycle() {
    let fx = fixture("s3");
    let client = Client::new();
    let timestamp_ms = now_ms();

    fx.handler
        .handle(&client.store_request(0, b"ephemeral", timestamp_ms, 1))
        .await
        .expect("store");

    tokio::time::sleep(Duration::from_millis(20)).await;
    fx.store.clean_expired(now_ms()).await.expect("clean");

    let reply = fx
        .handler
        .handle(&client.retrieve_request(0, None))
        .await
        .expect("retrieve");
    assert!(reply["messages"].as_array().expect("messages").is_empty());
    assert_eq!(fx.store.get_stats().await.expect("stats").message_count, 0);
}

// S4: an off-swarm store is relayed to the responsible swarm and the
// peer's reply returned verbatim; the same request arriving already
// forwarded gets wrong_swarm instead of a second hop.
#[tokio::test]
async fn wrong_swarm_forwards_once_then_redirects() {
    let fx = fixture_with("s4", Arc::new(RelayStub));
    let client = Client::new();

    // Two swarms half a ring apart; the account sits exactly on the
    // remote one, this node owns the other.
    let remote_swarm = client.account.ring_value();
    let local_swarm = remote_swarm.wrapping_add(u64::MAX / 2);
    let peer = |tag: u8| NodeRecord {
        address: format!("10.0.0.{tag}"),
        port: 22_021,
        pubkey: [tag; 32],
    };
    let mut members = HashMap::new();
    members.insert(local_swarm, vec![peer(1)]);
    members.insert(remote_swarm, vec![peer(2)]);
    fx.handler
        .router()
        .update(SwarmSnapshot::new(members, local_swarm));

    let mut request = client.store_request(0, b"hello", now_ms(), 60_000);
    let reply = fx.handler.handle(&request).await.expect("forwarded store");
    assert_eq!(reply, json!({ "relayed": 1 }));

    request.forwarded = true;
    match fx.handler.handle(&request).await {
        Err(Error::WrongSwarm { swarm_id }) => assert_eq!(swarm_id, remote_swarm),
        other => panic!("expected wrong_swarm, got {other:?}"),
    }
}

// S5: a subscribed connection sees exactly one envelope per matching
// store, with the data present when requested.
#[tokio::test]
async fn monitor_notification_flow() {
    let fx = fixture("s5");
    let client = Client::new();
    let sink = CollectingSink::new();
    let now_s = now_secs();

    let entry = client.monitor_entry(&[0, 1], true, now_s);
    let reply = handle_monitor_request(
        &entry,
        fx.handler.monitors(),
        fx.handler.authenticator(),
        fx.handler.router(),
        sink.clone(),
        now_s,
        Instant::now(),
    );
    assert_eq!(
        reply
            .as_dict()
            .expect("dict")
            .get(b"success".as_slice())
            .and_then(bt::Value::as_int),
        Some(1)
    );

    fx.handler
        .handle(&client.store_request(0, b"hi", now_ms(), 60_000))
        .await
        .expect("store in monitored namespace");
    fx.handler
        .handle(&client.store_request(2, b"quiet", now_ms(), 60_000))
        .await
        .expect("store in unmonitored namespace");

    let envelopes = sink.envelopes.lock().expect("sink lock");
    assert_eq!(envelopes.len(), 1);
    let decoded = bt::decode(&envelopes[0]).expect("envelope");
    let dict = decoded.as_dict().expect("dict");
    assert_eq!(
        dict.get(b"@".as_slice()).and_then(bt::Value::as_bytes),
        Some(client.account.0.as_slice())
    );
    assert_eq!(
        dict.get(b"~d".as_slice()).and_then(bt::Value::as_bytes),
        Some(b"hi".as_slice())
    );
    assert_eq!(dict.get(b"n".as_slice()).and_then(bt::Value::as_int), Some(0));
}

// S6: a full database refuses stores until cleanup frees pages.
#[tokio::test]
async fn capacity_recovers_after_cleanup() {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "swarmstore_scenario_s6_{}.db",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("now")
            .as_nanos()
    ));
    let client = Client::new();
    let timestamp_ms = now_ms();

    // Small budget: schema pages plus a little headroom for message rows.
    let store = MessageStore::open_with_limit(&path, 12).expect("open");
    let mut stored = 0u64;
    loop {
        let message = Message::new(
            client.account,
            0,
            vec![0xab; 8_192],
            timestamp_ms + stored as i64,
            timestamp_ms + 50,
        );
        match store.store(message, DuplicateHandling::Fail).await {
            Ok(_) => stored += 1,
            Err(Error::CapacityExceeded) => break,
            Err(err) => panic!("unexpected store failure: {err}"),
        }
        assert!(stored < 10_000, "page budget never filled");
    }
    assert!(stored > 0, "expected at least one successful store");

    // Wait out the short ttl, clean, and the same-sized store succeeds.
    tokio::time::sleep(Duration::from_millis(60)).await;
    store.clean_expired(now_ms()).await.expect("clean");
    // Deleted pages land on the freelist, so the used-page count drops.
    let fresh = Message::new(
        client.account,
        0,
        vec![0xcd; 8_192],
        now_ms(),
        now_ms() + 60_000,
    );
    store
        .store(fresh, DuplicateHandling::Fail)
        .await
        .expect("store after cleanup");

    let _ = std::fs::remove_file(path);
}

// Per-account ordering: a retrieve issued after an acknowledged store by
// the same client always sees that store.
#[tokio::test]
async fn acknowledged_store_is_visible_to_retrieve() {
    let fx = fixture("ordering");
    let client = Client::new();

    for round in 0..10i64 {
        let stored = fx
            .handler
            .handle(&client.store_request(0, format!("msg {round}").as_bytes(), now_ms() + round, 60_000))
            .await
            .expect("store");
        let hash = stored["hash"].as_str().expect("hash");

        let reply = fx
            .handler
            .handle(&client.retrieve_request(0, None))
            .await
            .expect("retrieve");
        let seen: Vec<&str> = reply["messages"]
            .as_array()
            .expect("messages")
            .iter()
            .filter_map(|msg| msg["hash"].as_str())
            .collect();
        assert!(seen.contains(&hash), "stored message missing from retrieve");
    }
}

// Every hash stored and not deleted stays retrievable until expiry.
#[tokio::test]
async fn stored_hashes_remain_retrievable() {
    let fx = fixture("inventory");
    let client = Client::new();
    let base_ts = now_ms();

    let mut hashes = Vec::new();
    for idx in 0..20i64 {
        let stored = fx
            .handler
            .handle(&client.store_request(0, format!("payload {idx}").as_bytes(), base_ts + idx, 600_000))
            .await
            .expect("store");
        hashes.push(stored["hash"].as_str().expect("hash").to_owned());
    }

    // Delete a few through the authenticated surface.
    let doomed: Vec<MessageHash> = hashes[3..6]
        .iter()
        .map(|hash| MessageHash::from_hex(hash).expect("hash"))
        .collect();
    let sig_ts = now_secs();
    let mut params = client.signed_json(&canonical::delete(&client.account, sig_ts, &doomed), sig_ts);
    params["messages"] = json!(doomed.iter().map(MessageHash::to_hex).collect::<Vec<_>>());
    fx.handler
        .handle(&Request {
            method: "delete".into(),
            params: Params::Json(params),
            encoding: Encoding::Json,
            source: "scenario".into(),
            forwarded: false,
        })
        .await
        .expect("delete");

    let reply = fx
        .handler
        .handle(&client.retrieve_request(0, None))
        .await
        .expect("retrieve");
    let seen: Vec<String> = reply["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .filter_map(|msg| msg["hash"].as_str().map(str::to_owned))
        .collect();
    for (idx, hash) in hashes.iter().enumerate() {
        if (3..6).contains(&idx) {
            assert!(!seen.contains(hash), "deleted hash still retrievable");
        } else {
            assert!(seen.contains(hash), "live hash missing");
        }
    }
}
