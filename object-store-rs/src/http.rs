// object-store-rs/src/http.rs
//
// HTTP transport against IPFS-style node APIs (POST /api/v0/...) with an
// optional cluster endpoint for replication pinning. One reqwest client is
// shared across nodes; per-call deadlines come from the client timeout.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::transport::{ObjectStat, ObjectTransport};
use crate::ObjectStoreError;

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct StatResponse {
    #[serde(rename = "CumulativeSize")]
    cumulative_size: u64,
    #[serde(rename = "NumLinks")]
    num_links: u64,
}

pub struct HttpObjectTransport {
    client: Client,
    /// Base URL of the cluster pinning API, when deployed.
    cluster_url: Option<String>,
}

impl HttpObjectTransport {
    pub fn new(call_timeout: Duration, cluster_url: Option<String>) -> Result<Self, ObjectStoreError> {
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| ObjectStoreError::Http(format!("client build: {e}")))?;
        Ok(Self {
            client,
            cluster_url,
        })
    }

    fn map_status(status: StatusCode, cid: &str) -> ObjectStoreError {
        if status == StatusCode::NOT_FOUND {
            ObjectStoreError::CidNotFound(cid.to_string())
        } else if status.is_server_error() {
            ObjectStoreError::NodeUnavailable(format!("upstream {status}"))
        } else {
            ObjectStoreError::Http(format!("unexpected status {status}"))
        }
    }

    fn map_send_error(e: reqwest::Error) -> ObjectStoreError {
        if e.is_timeout() {
            ObjectStoreError::Timeout("object store call timed out".to_string())
        } else if e.is_connect() {
            ObjectStoreError::NodeUnavailable(e.to_string())
        } else {
            ObjectStoreError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl ObjectTransport for HttpObjectTransport {
    async fn add_block(&self, node: &str, data: Vec<u8>) -> Result<String, ObjectStoreError> {
        let form = Form::new().part("file", Part::bytes(data).file_name("blob"));
        let resp = self
            .client
            .post(format!("{node}/api/v0/add?pin=false"))
            .multipart(form)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status(), "<new>"));
        }
        let body: AddResponse = resp
            .json()
            .await
            .map_err(|e| ObjectStoreError::Http(format!("add response: {e}")))?;
        Ok(body.hash)
    }

    async fn cat_block(&self, node: &str, cid: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let resp = self
            .client
            .post(format!("{node}/api/v0/cat?arg={cid}"))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status(), cid));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ObjectStoreError::Http(format!("cat body: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn pin_add(&self, node: &str, cid: &str) -> Result<(), ObjectStoreError> {
        let resp = self
            .client
            .post(format!("{node}/api/v0/pin/add?arg={cid}"))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status(), cid));
        }
        Ok(())
    }

    async fn pin_rm(&self, node: &str, cid: &str) -> Result<(), ObjectStoreError> {
        let resp = self
            .client
            .post(format!("{node}/api/v0/pin/rm?arg={cid}"))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        // Removing a pin that does not exist is a no-op for callers.
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Self::map_status(resp.status(), cid));
        }
        Ok(())
    }

    async fn stat(&self, node: &str, cid: &str) -> Result<ObjectStat, ObjectStoreError> {
        let resp = self
            .client
            .post(format!("{node}/api/v0/object/stat?arg={cid}"))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status(), cid));
        }
        let body: StatResponse = resp
            .json()
            .await
            .map_err(|e| ObjectStoreError::Http(format!("stat response: {e}")))?;
        Ok(ObjectStat {
            size: body.cumulative_size,
            blocks: body.num_links.max(1),
        })
    }

    async fn cluster_pin(
        &self,
        cid: &str,
        replication_min: u32,
        replication_max: u32,
    ) -> Result<(), ObjectStoreError> {
        let Some(cluster) = &self.cluster_url else {
            debug!(cid, "no cluster endpoint configured; skipping replication pin");
            return Ok(());
        };
        let resp = self
            .client
            .post(format!("{cluster}/pins/{cid}"))
            .json(&serde_json::json!({
                "replication_factor_min": replication_min,
                "replication_factor_max": replication_max,
            }))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status(), cid));
        }
        Ok(())
    }

    async fn cluster_unpin(&self, cid: &str) -> Result<(), ObjectStoreError> {
        let Some(cluster) = &self.cluster_url else {
            debug!(cid, "no cluster endpoint configured; skipping unpin");
            return Ok(());
        };
        let resp = self
            .client
            .delete(format!("{cluster}/pins/{cid}"))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Self::map_status(resp.status(), cid));
        }
        Ok(())
    }

    async fn healthcheck(&self, node: &str) -> bool {
        self.client
            .post(format!("{node}/api/v0/version"))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
