// This file is part of Tantu and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::link::RawLink;
use crate::{Seqno, Uid};

/// Status code for a successful response.
pub const SC_OK: u32 = 0;
/// Status code signalling the requested user is deleted.
pub const SC_DELETED: u32 = 216;

/// Status envelope of every server response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerStatus {
    pub code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Body of a `sig/get` response: a status envelope and the raw links.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigGetResponse {
    pub status: ServerStatus,
    #[serde(default)]
    pub sigs: Vec<RawLink>,
}

impl SigGetResponse {
    /// A successful response carrying the given links.
    #[must_use]
    pub fn ok(sigs: Vec<RawLink>) -> Self {
        Self {
            status: ServerStatus {
                code: SC_OK,
                name: Some("OK".to_string()),
            },
            sigs,
        }
    }
}

/// Decodes a raw `sig/get` body. Separated out so untrusted input
/// parsing can be fuzzed directly.
pub fn decode_server_body(body: &[u8]) -> Result<SigGetResponse, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Server capability: fetches the tail of a user's chain. `low` is the
/// last seqno already held locally; the server returns links with
/// `seqno > low`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_sigs(&self, uid: &Uid, low: Seqno) -> AnyResult<SigGetResponse>;
}

/// HTTP transport speaking the `sig/get` protocol.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_sigs(&self, uid: &Uid, low: Seqno) -> AnyResult<SigGetResponse> {
        let url = format!(
            "{}/sig/get?uid={uid}&low={low}&v2_compressed=true",
            self.base_url.trim_end_matches('/')
        );
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("sig/get request for {uid}"))?
            .bytes()
            .await
            .context("reading sig/get response body")?;
        decode_server_body(&body).with_context(|| format!("decoding sig/get response for {uid}"))
    }
}
