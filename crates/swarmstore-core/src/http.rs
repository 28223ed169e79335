// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::json;

use crate::{
    error::Error,
    rpc::{Encoding, Params, Request, RequestHandler},
};

pub const RPC_PATH: &str = "/storage_rpc/v1";

/// Wall-clock budget per request.  On expiry the response is abandoned;
/// an in-flight storage write still runs to completion.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct HttpState {
    handler: Arc<RequestHandler>,
}

/// Build the HTTPS-facing router: `POST /storage_rpc/v1` with a JSON body
/// `{"method": NAME, "params": {...}}`.
pub fn router(handler: Arc<RequestHandler>) -> Router {
    Router::new()
        .route(RPC_PATH, post(storage_rpc))
        .with_state(HttpState { handler })
}

async fn storage_rpc(
    State(state): State<HttpState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let source = remote
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "http".to_owned());

    let method = match body.get("method").and_then(serde_json::Value::as_str) {
        Some(method) => method.to_owned(),
        None => {
            return error_response(
                &state.handler,
                &Error::BadRequest("missing method".into()),
            )
        }
    };
    let params = body.get("params").cloned().unwrap_or_else(|| json!({}));
    let request = Request {
        method,
        params: Params::Json(params),
        encoding: Encoding::Json,
        source,
        forwarded: false,
    };

    match tokio::time::timeout(REQUEST_DEADLINE, state.handler.handle(&request)).await {
        Ok(Ok(value)) => (StatusCode::OK, Json(value)).into_response(),
        Ok(Err(err)) => error_response(&state.handler, &err),
        Err(_) => {
            tracing::warn!(method = %request.method, "request deadline exceeded");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "error": { "kind": "internal_error", "detail": "deadline exceeded" } })),
            )
                .into_response()
        }
    }
}

/// Map an error kind to its status code and body.  `wrong_swarm` carries
/// the responsible swarm and its members so clients can redirect.
fn error_response(handler: &RequestHandler, err: &Error) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({
        "error": { "kind": err.kind(), "detail": err.to_string() },
    });
    if let Error::WrongSwarm { swarm_id } = err {
        let snapshot = handler.router().snapshot();
        let snodes: Vec<serde_json::Value> = snapshot
            .peers_of(*swarm_id)
            .iter()
            .map(|node| {
                json!({
                    "address": node.address,
                    "port": node.port,
                    "pubkey_ed25519": hex::encode(node.pubkey),
                })
            })
            .collect();
        body["swarm_id"] = json!(swarm_id);
        body["snodes"] = json!(snodes);
    }
    (status, Json(body)).into_response()
}
