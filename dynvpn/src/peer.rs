use serde::Serialize;
use thiserror::Error;

use std::net::Ipv4Addr;
use std::time::Duration;

use dynvpn_lib::state::{self, StateDocument};

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response status {0}")]
    Status(u16),
    #[error("invalid state document: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct PullStateRequest<'a> {
    site_id: &'a str,
}

/// HTTP side of the gossip protocol. Plaintext HTTP/1.1; transport security
/// between sites is provided externally.
#[derive(Clone, Debug)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new() -> Self {
        PeerClient {
            http: reqwest::Client::new(),
        }
    }

    /// Single POST of our state document. No retries; the periodic pull
    /// reconciles missed pushes.
    pub async fn push_state(
        &self,
        addr: Ipv4Addr,
        port: u16,
        timeout: Duration,
        doc: &StateDocument,
    ) -> Result<(), Error> {
        let resp = self
            .http
            .post(format!("http://{addr}:{port}/peer/push_state"))
            .timeout(timeout)
            .json(doc)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Status(resp.status().as_u16()))
        }
    }

    /// Fetch a peer's state document, identifying ourselves as the caller.
    pub async fn pull_state(
        &self,
        addr: Ipv4Addr,
        port: u16,
        timeout: Duration,
        local_site: &str,
    ) -> Result<StateDocument, Error> {
        let resp = self
            .http
            .get(format!("http://{addr}:{port}/peer/pull_state"))
            .timeout(timeout)
            .json(&PullStateRequest { site_id: local_site })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        Ok(state::decode(&body)?)
    }
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}
