// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{collections::BTreeMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;

use crate::{
    auth::{canonical, AuthCredentials, Authenticator},
    bt,
    config::NodeConfig,
    error::{Error, Result},
    ids::{AccountId, MessageHash},
    message::{now_ms, now_secs, Message, RetentionTable},
    monitor::MonitorRegistry,
    onion,
    rate_limit::RateLimiter,
    store::{DuplicateHandling, MessageStore, StoreOutcome},
    swarm::{NodeRecord, SwarmId, SwarmRouter},
};

/// Which wire encoding a request arrived in; the response mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Bt,
}

/// Decoded request argument: a mapping of named fields in either encoding.
/// Byte fields are base64 strings in JSON and raw byte strings in bencode;
/// the accessors normalize both.
#[derive(Debug, Clone)]
pub enum Params {
    Json(serde_json::Value),
    Bt(bt::Value),
}

impl Params {
    fn json_field(&self, key: &str) -> Result<Option<&serde_json::Value>> {
        match self {
            Params::Json(serde_json::Value::Object(map)) => Ok(map.get(key)),
            Params::Json(_) => Err(Error::BadRequest("params must be a dict".into())),
            Params::Bt(_) => unreachable!("bt params resolve through bt_field"),
        }
    }

    fn bt_field(&self, key: &str) -> Result<Option<&bt::Value>> {
        match self {
            Params::Bt(value) => match value.as_dict() {
                Some(dict) => Ok(dict.get(key.as_bytes())),
                None => Err(Error::BadRequest("params must be a dict".into())),
            },
            Params::Json(_) => unreachable!("json params resolve through json_field"),
        }
    }

    pub fn int(&self, key: &str) -> Result<Option<i64>> {
        match self {
            Params::Json(_) => match self.json_field(key)? {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(serde_json::Value::Number(n)) => n
                    .as_i64()
                    .map(Some)
                    .ok_or_else(|| Error::BadRequest(format!("field {key} is not an integer"))),
                Some(_) => Err(Error::BadRequest(format!("field {key} is not an integer"))),
            },
            Params::Bt(_) => match self.bt_field(key)? {
                None => Ok(None),
                Some(value) => value
                    .as_int()
                    .map(Some)
                    .ok_or_else(|| Error::BadRequest(format!("field {key} is not an integer"))),
            },
        }
    }

    pub fn string(&self, key: &str) -> Result<Option<String>> {
        match self {
            Params::Json(_) => match self.json_field(key)? {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
                Some(_) => Err(Error::BadRequest(format!("field {key} is not a string"))),
            },
            Params::Bt(_) => match self.bt_field(key)? {
                None => Ok(None),
                Some(value) => {
                    let raw = value.as_bytes().ok_or_else(|| {
                        Error::BadRequest(format!("field {key} is not a string"))
                    })?;
                    String::from_utf8(raw.to_vec())
                        .map(Some)
                        .map_err(|_| Error::BadRequest(format!("field {key} is not utf-8")))
                }
            },
        }
    }

    /// Raw bytes: base64 text in JSON, a byte string in bencode.
    pub fn bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Params::Json(_) => match self.json_field(key)? {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(serde_json::Value::String(s)) => base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map(Some)
                    .map_err(|_| Error::BadRequest(format!("field {key} is not valid base64"))),
                Some(_) => Err(Error::BadRequest(format!("field {key} is not a string"))),
            },
            Params::Bt(_) => match self.bt_field(key)? {
                None => Ok(None),
                Some(value) => value
                    .as_bytes()
                    .map(|raw| Some(raw.to_vec()))
                    .ok_or_else(|| Error::BadRequest(format!("field {key} is not a byte string"))),
            },
        }
    }

    /// Fixed-size byte field; accepts hex text of the right length too.
    pub fn byte_array<const N: usize>(&self, key: &str) -> Result<Option<[u8; N]>> {
        let raw = match self {
            Params::Json(_) => match self.json_field(key)? {
                None | Some(serde_json::Value::Null) => return Ok(None),
                Some(serde_json::Value::String(s)) => decode_hex_or_base64(s, N)
                    .ok_or_else(|| Error::BadRequest(format!("field {key} is malformed")))?,
                Some(_) => return Err(Error::BadRequest(format!("field {key} is not a string"))),
            },
            Params::Bt(_) => match self.bt_field(key)? {
                None => return Ok(None),
                Some(value) => {
                    let raw = value.as_bytes().ok_or_else(|| {
                        Error::BadRequest(format!("field {key} is not a byte string"))
                    })?;
                    if raw.len() == N {
                        raw.to_vec()
                    } else {
                        // Tolerate ascii-hex in bencoded requests as well.
                        std::str::from_utf8(raw)
                            .ok()
                            .and_then(|s| decode_hex_or_base64(s, N))
                            .ok_or_else(|| {
                                Error::BadRequest(format!("field {key} has the wrong length"))
                            })?
                    }
                }
            },
        };
        let mut out = [0u8; N];
        out.copy_from_slice(&raw);
        Ok(Some(out))
    }

    pub fn hash(&self, key: &str) -> Result<Option<MessageHash>> {
        Ok(self.byte_array::<32>(key)?.map(MessageHash))
    }

    pub fn hash_list(&self, key: &str) -> Result<Option<Vec<MessageHash>>> {
        let parse_one = |text: &str| -> Result<MessageHash> {
            decode_hex_or_base64(text, 32)
                .as_deref()
                .map(MessageHash::from_bytes)
                .transpose()?
                .ok_or_else(|| Error::BadRequest(format!("field {key} holds a malformed hash")))
        };
        match self {
            Params::Json(_) => match self.json_field(key)? {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => parse_one(s),
                        _ => Err(Error::BadRequest(format!("field {key} must hold strings"))),
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Some),
                Some(_) => Err(Error::BadRequest(format!("field {key} is not a list"))),
            },
            Params::Bt(_) => match self.bt_field(key)? {
                None => Ok(None),
                Some(value) => value
                    .as_list()
                    .ok_or_else(|| Error::BadRequest(format!("field {key} is not a list")))?
                    .iter()
                    .map(|item| {
                        let raw = item.as_bytes().ok_or_else(|| {
                            Error::BadRequest(format!("field {key} must hold byte strings"))
                        })?;
                        if raw.len() == 32 {
                            MessageHash::from_bytes(raw)
                        } else {
                            std::str::from_utf8(raw)
                                .map_err(|_| {
                                    Error::BadRequest(format!("field {key} holds a malformed hash"))
                                })
                                .and_then(parse_one)
                        }
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Some),
            },
        }
    }
}

fn decode_hex_or_base64(text: &str, len: usize) -> Option<Vec<u8>> {
    if text.len() == len * 2 {
        if let Ok(raw) = hex::decode(text) {
            return Some(raw);
        }
    }
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .ok()
        .filter(|raw| raw.len() == len)
}

/// A decoded client request, transport-independent.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub params: Params,
    pub encoding: Encoding,
    /// Client identity for rate limiting: remote address for public
    /// methods, replaced by the account for authenticated ones.
    pub source: String,
    /// Set when this request was relayed by another swarm member; such
    /// requests are never re-forwarded.
    pub forwarded: bool,
}

/// Relays an off-swarm request to a member of the responsible swarm and
/// returns the peer's reply verbatim.
#[async_trait]
pub trait SwarmForwarder: Send + Sync {
    async fn forward(
        &self,
        swarm_id: SwarmId,
        peers: Vec<NodeRecord>,
        request: &Request,
    ) -> Result<serde_json::Value>;
}

/// Forwarder that redirects instead of relaying: callers get the
/// `wrong_swarm` error with the responsible swarm attached.
pub struct RedirectForwarder;

#[async_trait]
impl SwarmForwarder for RedirectForwarder {
    async fn forward(
        &self,
        swarm_id: SwarmId,
        _peers: Vec<NodeRecord>,
        _request: &Request,
    ) -> Result<serde_json::Value> {
        Err(Error::WrongSwarm { swarm_id })
    }
}

/// Validates and dispatches client RPC calls against the storage, monitor
/// and swarm subsystems.
pub struct RequestHandler {
    store: Arc<MessageStore>,
    auth: Authenticator,
    router: Arc<SwarmRouter>,
    monitors: Arc<MonitorRegistry>,
    forwarder: Arc<dyn SwarmForwarder>,
    public_limit: RateLimiter,
    account_limit: RateLimiter,
    retention: RetentionTable,
    version: [u16; 3],
    hardfork: u16,
}

impl RequestHandler {
    pub fn new(
        config: &NodeConfig,
        store: Arc<MessageStore>,
        router: Arc<SwarmRouter>,
        monitors: Arc<MonitorRegistry>,
        forwarder: Arc<dyn SwarmForwarder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            auth: Authenticator::new(config.network),
            router,
            monitors,
            forwarder,
            public_limit: RateLimiter::new(config.public_rate_per_minute),
            account_limit: RateLimiter::new(config.account_rate_per_minute),
            retention: config.retention.clone(),
            version: config.version,
            hardfork: config.hardfork,
        })
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    pub fn router(&self) -> &Arc<SwarmRouter> {
        &self.router
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    /// Dispatch one decoded request and produce its response value.  The
    /// caller wraps the value back into the request's encoding.
    pub async fn handle(&self, request: &Request) -> Result<serde_json::Value> {
        match request.method.as_str() {
            "info" | "ping" | "get_swarm" => {
                if !self.public_limit.try_acquire(&request.source) {
                    return Err(Error::RateLimited);
                }
                match request.method.as_str() {
                    "info" => Ok(self.info_response()),
                    "ping" => Ok(json!({ "pong": 1 })),
                    _ => self.get_swarm(&request.params),
                }
            }
            "store" | "retrieve" | "delete" | "delete_all" | "expire" => {
                self.handle_authenticated(request).await
            }
            other => Err(Error::BadRequest(format!("unknown method {other:?}"))),
        }
    }

    /// Decode an innermost onion payload and run it as an ordinary client
    /// request.  The inner body is a JSON `{"method", "params"}` document.
    pub async fn handle_onion_payload(
        &self,
        payload: &[u8],
        source: String,
    ) -> Result<serde_json::Value> {
        let (inner, metadata) = onion::decode(payload)?;
        let body: serde_json::Value = serde_json::from_slice(&inner)
            .map_err(|_| Error::BadRequest("onion payload is not valid json".into()))?;
        let method = body
            .get("method")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::BadRequest("onion payload missing method".into()))?
            .to_owned();
        let params = body
            .get("params")
            .cloned()
            .unwrap_or_else(|| json!({}));
        tracing::debug!(method = %method, enc = ?metadata.enc_type, "terminating onion request");
        let request = Request {
            method,
            params: Params::Json(params),
            encoding: Encoding::Json,
            source,
            forwarded: false,
        };
        self.handle(&request).await
    }

    async fn handle_authenticated(&self, request: &Request) -> Result<serde_json::Value> {
        let creds = self.parse_credentials(&request.params)?;
        let account = creds.account;

        if !self.account_limit.try_acquire(&account.to_hex()) {
            return Err(Error::RateLimited);
        }

        if !self.router.is_local(&account) {
            let swarm_id = self.router.swarm_of(&account);
            if request.forwarded {
                return Err(Error::WrongSwarm { swarm_id });
            }
            tracing::debug!(
                account = %account.to_hex(),
                swarm = swarm_id,
                method = %request.method,
                "forwarding off-swarm request"
            );
            let peers = self.router.peers_of(&account);
            return self.forwarder.forward(swarm_id, peers, request).await;
        }

        match request.method.as_str() {
            "store" => self.store_message(&request.params, &creds).await,
            "retrieve" => self.retrieve(&request.params, &creds).await,
            "delete" => self.delete(&request.params, &creds).await,
            "delete_all" => self.delete_all(&request.params, &creds).await,
            "expire" => self.expire(&request.params, &creds).await,
            _ => unreachable!("checked by handle"),
        }
    }

    fn parse_credentials(&self, params: &Params) -> Result<AuthCredentials> {
        let account = match params {
            Params::Json(_) => {
                let text = params
                    .string("pubkey")?
                    .ok_or_else(|| Error::BadRequest("missing field pubkey".into()))?;
                AccountId::from_hex(&text, self.auth.network())?
            }
            Params::Bt(_) => {
                let raw = params
                    .byte_array::<33>("pubkey")?
                    .ok_or_else(|| Error::BadRequest("missing field pubkey".into()))?;
                AccountId::from_bytes(&raw, self.auth.network())?
            }
        };
        let signature = params
            .byte_array::<64>("signature")?
            .ok_or_else(|| Error::BadRequest("missing field signature".into()))?;
        let timestamp_s = params
            .int("sig_timestamp")?
            .ok_or_else(|| Error::BadRequest("missing field sig_timestamp".into()))?;
        Ok(AuthCredentials {
            account,
            ed_pubkey: params.byte_array::<32>("pubkey_ed25519")?,
            subkey: params.byte_array::<32>("subkey")?,
            signature,
            timestamp_s,
        })
    }

    fn namespace_of(&self, params: &Params) -> Result<i16> {
        match params.int("namespace")? {
            None => Ok(0),
            Some(ns) => i16::try_from(ns)
                .map_err(|_| Error::InvalidNamespace(format!("namespace {ns} out of range"))),
        }
    }

    async fn store_message(
        &self,
        params: &Params,
        creds: &AuthCredentials,
    ) -> Result<serde_json::Value> {
        let namespace = self.namespace_of(params)?;
        let signed = canonical::store(&creds.account, namespace, creds.timestamp_s);
        self.auth.verify(creds, &signed, now_secs())?;

        let data = params
            .bytes("data")?
            .ok_or_else(|| Error::BadRequest("missing field data".into()))?;
        let timestamp_ms = params
            .int("timestamp")?
            .ok_or_else(|| Error::BadRequest("missing field timestamp".into()))?;
        let expiry_ms = match (params.int("ttl")?, params.int("expiry")?) {
            (Some(ttl), None) => timestamp_ms + ttl,
            (None, Some(expiry)) => expiry,
            (Some(_), Some(_)) => {
                return Err(Error::BadRequest("give either ttl or expiry, not both".into()))
            }
            (None, None) => return Err(Error::BadRequest("missing field ttl or expiry".into())),
        };

        let message = Message::new(creds.account, namespace, data, timestamp_ms, expiry_ms);
        message.validate(&self.retention)?;

        let outcome = self
            .store
            .store(message.clone(), DuplicateHandling::Ignore)
            .await?;
        // Notify only after the write is durably committed, and only for
        // first sightings: a duplicate store is not a new message.
        if outcome == StoreOutcome::Stored {
            self.monitors.notify(&message, Instant::now());
        }

        Ok(json!({
            "hash": message.hash.to_hex(),
            "expiry": message.expiry_ms,
        }))
    }

    async fn retrieve(
        &self,
        params: &Params,
        creds: &AuthCredentials,
    ) -> Result<serde_json::Value> {
        let namespace = self.namespace_of(params)?;
        let signed = canonical::retrieve(&creds.account, namespace, creds.timestamp_s);
        self.auth.verify(creds, &signed, now_secs())?;

        let since_hash = params.hash("last_hash")?;
        let limit = params
            .int("max_count")?
            .map(|count| usize::try_from(count).unwrap_or(usize::MAX));
        let messages = self
            .store
            .retrieve(creds.account, namespace, since_hash, limit, now_ms())
            .await?;

        let rendered: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                json!({
                    "hash": msg.hash.to_hex(),
                    "timestamp": msg.timestamp_ms,
                    "expiry": msg.expiry_ms,
                    "data": base64::engine::general_purpose::STANDARD.encode(&msg.data),
                })
            })
            .collect();
        Ok(json!({ "messages": rendered }))
    }

    async fn delete(&self, params: &Params, creds: &AuthCredentials) -> Result<serde_json::Value> {
        let hashes = params
            .hash_list("messages")?
            .ok_or_else(|| Error::BadRequest("missing field messages".into()))?;
        let signed = canonical::delete(&creds.account, creds.timestamp_s, &hashes);
        self.auth.verify(creds, &signed, now_secs())?;

        let deleted = self.store.delete_by_hash(creds.account, hashes).await?;
        Ok(json!({
            "deleted": deleted.iter().map(MessageHash::to_hex).collect::<Vec<_>>(),
        }))
    }

    async fn delete_all(
        &self,
        params: &Params,
        creds: &AuthCredentials,
    ) -> Result<serde_json::Value> {
        let namespace = match params.int("namespace")? {
            None => None,
            Some(ns) => Some(i16::try_from(ns).map_err(|_| {
                Error::InvalidNamespace(format!("namespace {ns} out of range"))
            })?),
        };
        let before_ms = params
            .int("before")?
            .ok_or_else(|| Error::BadRequest("missing field before".into()))?;
        let signed =
            canonical::delete_all(&creds.account, namespace, before_ms, creds.timestamp_s);
        self.auth.verify(creds, &signed, now_secs())?;

        let deleted = self
            .store
            .delete_all_before(creds.account, namespace.map(|ns| vec![ns]), before_ms)
            .await?;
        Ok(json!({
            "deleted": deleted.iter().map(MessageHash::to_hex).collect::<Vec<_>>(),
        }))
    }

    async fn expire(&self, params: &Params, creds: &AuthCredentials) -> Result<serde_json::Value> {
        let hashes = params
            .hash_list("messages")?
            .ok_or_else(|| Error::BadRequest("missing field messages".into()))?;
        let expiry_ms = params
            .int("expiry")?
            .ok_or_else(|| Error::BadRequest("missing field expiry".into()))?;
        let signed = canonical::expire(&creds.account, expiry_ms, creds.timestamp_s, &hashes);
        self.auth.verify(creds, &signed, now_secs())?;

        // The hash list may span namespaces, so the cap is the widest
        // bound the configured retention table allows.
        let updated = self
            .store
            .update_expiry(
                creds.account,
                hashes,
                expiry_ms,
                self.retention.max_ttl_any().as_millis() as i64,
            )
            .await?;
        Ok(json!({
            "updated": updated.iter().map(MessageHash::to_hex).collect::<Vec<_>>(),
            "expiry": expiry_ms,
        }))
    }

    fn get_swarm(&self, params: &Params) -> Result<serde_json::Value> {
        let account = match params {
            Params::Json(_) => {
                let text = params
                    .string("pubkey")?
                    .ok_or_else(|| Error::BadRequest("missing field pubkey".into()))?;
                AccountId::from_hex(&text, self.auth.network())?
            }
            Params::Bt(_) => {
                let raw = params
                    .byte_array::<33>("pubkey")?
                    .ok_or_else(|| Error::BadRequest("missing field pubkey".into()))?;
                AccountId::from_bytes(&raw, self.auth.network())?
            }
        };
        let snapshot = self.router.snapshot();
        let swarm_id = snapshot.swarm_of(&account);
        let snodes: Vec<serde_json::Value> = snapshot
            .peers_of(swarm_id)
            .iter()
            .map(|node| {
                json!({
                    "address": node.address,
                    "port": node.port,
                    "pubkey_ed25519": hex::encode(node.pubkey),
                })
            })
            .collect();
        Ok(json!({ "swarm_id": swarm_id, "snodes": snodes }))
    }

    fn info_response(&self) -> serde_json::Value {
        json!({
            "version": self.version,
            "hf": self.hardfork,
            "timestamp": now_ms(),
        })
    }
}

/// Serialize a response value in the encoding the request used.  Byte
/// fields that are textual in the JSON rendering (base64 data, hex hashes
/// and node keys) come out as raw byte strings on the bencoded surface.
pub fn encode_response(encoding: Encoding, value: &serde_json::Value) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Json => serde_json::to_vec(value)
            .map_err(|err| Error::Internal(format!("response encoding: {err}"))),
        Encoding::Bt => Ok(bt::encode(&response_to_bt(value)?)),
    }
}

/// Render a response for the bencoded surface.  The generic
/// [`bt::json_to_bt`] converter keeps strings as-is, so the fields known
/// to hold bytes are decoded here: `data` is base64, `hash`,
/// `deleted`/`updated` entries and `pubkey_ed25519` are hex.
fn response_to_bt(value: &serde_json::Value) -> Result<bt::Value> {
    convert_response_value(None, value)
}

fn convert_response_value(key: Option<&str>, value: &serde_json::Value) -> Result<bt::Value> {
    match value {
        serde_json::Value::String(text) => match key {
            Some("data") => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map(bt::Value::Bytes)
                .map_err(|_| Error::Internal("response data field is not base64".into())),
            Some(field @ ("hash" | "deleted" | "updated" | "pubkey_ed25519")) => hex::decode(text)
                .map(bt::Value::Bytes)
                .map_err(|_| Error::Internal(format!("response field {field} is not hex"))),
            _ => Ok(bt::Value::Bytes(text.as_bytes().to_vec())),
        },
        // List entries keep the field name so hash lists decode per item.
        serde_json::Value::Array(items) => Ok(bt::Value::List(
            items
                .iter()
                .map(|item| convert_response_value(key, item))
                .collect::<Result<Vec<_>>>()?,
        )),
        serde_json::Value::Object(entries) => {
            let mut dict = BTreeMap::new();
            for (entry_key, entry) in entries {
                dict.insert(
                    entry_key.as_bytes().to_vec(),
                    convert_response_value(Some(entry_key), entry)?,
                );
            }
            Ok(bt::Value::Dict(dict))
        }
        other => bt::json_to_bt(other),
    }
}
