use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use std::sync::Arc;

use dynvpn_lib::state;
use dynvpn_lib::status::ReplicaMode;

use crate::node::{Error, Node, OnlineOptions};

/// Peer protocol plus the operator-facing control API, one router.
///
/// Application errors are reported as `{"error": "..."}` with HTTP 200; only
/// transport-level problems surface as non-2xx.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/peer/pull_state", get(peer_pull_state))
        .route("/peer/push_state", post(peer_push_state))
        .route("/vpn/set_online/{name}", post(vpn_set_online))
        .route("/vpn/set_offline/{name}", post(vpn_set_offline))
        .route("/vpn/set_replica/{name}", post(vpn_set_replica))
        .route("/vpn/restart/{name}", post(vpn_restart))
        .route("/shutdown", post(shutdown))
        .route("/set_replica_mode/{value}", post(set_replica_mode))
        .route("/node_state", get(node_state))
        .route("/debug_state", get(debug_state))
        .with_state(node)
}

pub async fn serve(node: Arc<Node>, listener: tokio::net::TcpListener) {
    if let Err(e) = axum::serve(listener, router(node)).await {
        tracing::error!(error = %e, "control server terminated");
    }
}

fn ok() -> Json<Value> {
    Json(json!({}))
}

fn err(msg: impl Into<String>) -> Json<Value> {
    Json(json!({ "error": msg.into() }))
}

fn from_result(result: Result<(), Error>) -> Json<Value> {
    match result {
        Ok(()) => ok(),
        Err(e) => err(e.to_string()),
    }
}

fn from_outcome(outcome: Option<Result<(), Error>>) -> Json<Value> {
    match outcome {
        Some(result) => from_result(result),
        None => err("operation did not complete"),
    }
}

fn pretty_json(text: String) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], format!("{text}\n"))
}

#[derive(Debug, Deserialize)]
struct PullStateRequest {
    site_id: String,
}

async fn peer_pull_state(State(node): State<Arc<Node>>, Json(req): Json<PullStateRequest>) -> Json<Value> {
    match node.handle_pull(&req.site_id) {
        Some(doc) => Json(serde_json::to_value(&doc).unwrap_or_else(|_| json!({}))),
        None => ok(),
    }
}

async fn peer_push_state(State(node): State<Arc<Node>>, body: String) -> Json<Value> {
    match state::decode(&body) {
        Ok(doc) => {
            node.handle_push(doc);
            ok()
        }
        Err(e) => {
            tracing::warn!(error = %e, "rejecting malformed push_state document");
            err(e.to_string())
        }
    }
}

async fn vpn_set_online(State(node): State<Arc<Node>>, Path(name): Path<String>) -> Json<Value> {
    let fut = {
        let node = node.clone();
        let vpn = name.clone();
        async move { node.vpn_online(&vpn, OnlineOptions::default()).await }
    };
    match node.admin_task(&format!("set_online({name})"), fut).await {
        Some(Ok(_)) => ok(),
        Some(Err(Error::Timeout(_))) => err("timed out"),
        Some(Err(e)) => err(e.to_string()),
        None => err("operation did not complete"),
    }
}

async fn vpn_set_offline(State(node): State<Arc<Node>>, Path(name): Path<String>) -> Json<Value> {
    let fut = {
        let node = node.clone();
        let vpn = name.clone();
        async move { node.vpn_offline(&vpn, true).await }
    };
    from_outcome(node.admin_task(&format!("set_offline({name})"), fut).await)
}

async fn vpn_set_replica(State(node): State<Arc<Node>>, Path(name): Path<String>) -> Json<Value> {
    if node.replica_mode() == ReplicaMode::Disabled {
        return err("replica mode is Disabled");
    }
    let fut = {
        let node = node.clone();
        let vpn = name.clone();
        async move { node.vpn_replica(&vpn, true).await }
    };
    from_outcome(node.admin_task(&format!("set_replica({name})"), fut).await)
}

async fn vpn_restart(State(node): State<Arc<Node>>, Path(name): Path<String>) -> Json<Value> {
    let fut = {
        let node = node.clone();
        let vpn = name.clone();
        async move { node.restart_vpn(&vpn).await }
    };
    from_outcome(node.admin_task(&format!("restart({name})"), fut).await)
}

async fn shutdown(State(node): State<Arc<Node>>) -> Json<Value> {
    let fut = {
        let node = node.clone();
        async move { node.shutdown_site().await }
    };
    match node.admin_task("shutdown", fut).await {
        Some(()) => ok(),
        None => err("operation did not complete"),
    }
}

async fn set_replica_mode(State(node): State<Arc<Node>>, Path(value): Path<String>) -> Json<Value> {
    match value.parse::<ReplicaMode>() {
        Ok(mode) => {
            node.set_replica_mode(mode);
            ok()
        }
        Err(e) => err(e.to_string()),
    }
}

async fn node_state(State(node): State<Arc<Node>>) -> impl IntoResponse {
    pretty_json(node.pretty_state())
}

async fn debug_state(State(node): State<Arc<Node>>) -> impl IntoResponse {
    pretty_json(node.pretty_debug_state())
}
