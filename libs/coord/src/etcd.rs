//! etcd client speaking the v2 keys API over HTTP.
//!
//! The v2 API maps one-to-one onto the [`CoordStore`] contract: keys live
//! under `/v2/keys`, writes are form-encoded `PUT`s, leases are the `ttl`
//! parameter, and the conditional create is `prevExist=false`, which fails
//! with error code 105 when the key is already present.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{CoordError, CoordStore, CreateOutcome};

/// Timeout for individual store requests. Generous relative to the agent
/// tick; a slow store surfaces as a transient tick failure, not a hang.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// etcd v2 error code for "key not found".
const CODE_KEY_NOT_FOUND: u64 = 100;

/// etcd v2 error code for "key already exists".
const CODE_NODE_EXIST: u64 = 105;

/// Client for an etcd endpoint speaking the v2 keys API.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    client: reqwest::Client,
    base_url: String,
}

impl EtcdStore {
    /// Create a client for the given endpoint, e.g. `http://127.0.0.1:2379`.
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.base_url, key)
    }
}

/// Successful response body for the keys API.
#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: KeyNode,
}

#[derive(Debug, Deserialize)]
struct KeyNode {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    nodes: Vec<KeyNode>,
}

/// Error response body for the keys API.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
}

/// A non-success response, decoded far enough to branch on the etcd error
/// code before deciding whether it is an expected outcome or an error.
struct ApiFailure {
    status: u16,
    code: Option<u64>,
    message: String,
}

impl ApiFailure {
    fn into_error(self) -> CoordError {
        CoordError::Api {
            status: self.status,
            code: self.code,
            message: self.message,
        }
    }
}

async fn decode_failure(response: reqwest::Response) -> ApiFailure {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => ApiFailure {
            status,
            code: Some(err.error_code),
            message: err.message,
        },
        Err(_) => ApiFailure {
            status,
            code: None,
            message: body.trim().to_string(),
        },
    }
}

#[async_trait]
impl CoordStore for EtcdStore {
    async fn read(&self, key: &str) -> Result<Option<String>, CoordError> {
        let url = self.key_url(key);
        debug!(key = %key, "etcd read");

        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            let body: KeysResponse = response.json().await?;
            return Ok(body.node.value);
        }

        let failure = decode_failure(response).await;
        if failure.code == Some(CODE_KEY_NOT_FOUND) {
            return Ok(None);
        }
        Err(failure.into_error())
    }

    async fn write(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordError> {
        let url = self.key_url(key);
        debug!(key = %key, ttl_secs = ttl.map(|t| t.as_secs()), "etcd write");

        let mut form: Vec<(&str, String)> = vec![("value", value.to_string())];
        if let Some(ttl) = ttl {
            // The v2 API takes whole seconds and rejects a zero lease.
            form.push(("ttl", ttl.as_secs().max(1).to_string()));
        }

        let response = self.client.put(&url).form(&form).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(decode_failure(response).await.into_error())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<CreateOutcome, CoordError> {
        let url = self.key_url(key);
        debug!(key = %key, ttl_secs = ttl.as_secs(), "etcd conditional create");

        let form: Vec<(&str, String)> = vec![
            ("value", value.to_string()),
            ("ttl", ttl.as_secs().max(1).to_string()),
            ("prevExist", "false".to_string()),
        ];

        let response = self.client.put(&url).form(&form).send().await?;
        if response.status().is_success() {
            return Ok(CreateOutcome::Created);
        }

        let failure = decode_failure(response).await;
        if failure.code == Some(CODE_NODE_EXIST) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        Err(failure.into_error())
    }

    async fn list_children(&self, key: &str) -> Result<BTreeMap<String, String>, CoordError> {
        let url = self.key_url(key);
        debug!(key = %key, "etcd list");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let failure = decode_failure(response).await;
            // A directory nobody has written into yet is an empty set, not
            // an error; the desired/claimed trees start out absent.
            if failure.code == Some(CODE_KEY_NOT_FOUND) {
                return Ok(BTreeMap::new());
            }
            return Err(failure.into_error());
        }

        let body: KeysResponse = response.json().await?;
        let mut children = BTreeMap::new();
        for child in body.node.nodes {
            // Nested directories carry no value and are not ours to parse.
            let Some(value) = child.value else { continue };
            let short_key = child.key.rsplit('/').next().unwrap_or("");
            if !short_key.is_empty() {
                children.insert(short_key.to_string(), value);
            }
        }
        Ok(children)
    }
}
