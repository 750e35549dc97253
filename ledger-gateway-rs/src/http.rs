// ledger-gateway-rs/src/http.rs
//
// HTTP transport against the REST bridge fronting the permissioned network.
// Submit/evaluate map onto bridge endpoints; events are long-polled into an
// mpsc channel by a background task owned by the stream receiver.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::transport::{LedgerTransport, RawEvent};
use crate::LedgerError;

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_id: String,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    name: String,
    payload: Value,
    #[serde(default)]
    tx_id: String,
}

pub struct HttpLedgerTransport {
    client: Client,
    base_url: String,
    user_id: String,
    msp_id: String,
}

impl HttpLedgerTransport {
    pub fn new(
        base_url: String,
        user_id: String,
        msp_id: String,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::ChannelUnavailable(format!("client build: {e}")))?;
        Ok(Self {
            client,
            base_url,
            user_id,
            msp_id,
        })
    }

    fn chaincode_url(&self, channel: &str, chaincode: &str, op: &str) -> String {
        format!(
            "{}/channels/{channel}/chaincodes/{chaincode}/{op}",
            self.base_url
        )
    }

    async fn map_error(resp: reqwest::Response, function: &str) -> LedgerError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            // The bridge reports both unknown functions and unknown keys as
            // 404; the body tells them apart.
            if body.to_ascii_lowercase().contains("function") {
                return LedgerError::FunctionNotFound(function.to_string());
            }
            return LedgerError::NotFound(body);
        }
        if status.is_server_error() {
            return LedgerError::ChannelUnavailable(format!("upstream {status}: {body}"));
        }
        LedgerError::ChaincodeError(format!("{status}: {body}"))
    }

    fn map_send_error(e: reqwest::Error) -> LedgerError {
        if e.is_timeout() {
            LedgerError::Timeout("ledger call timed out".to_string())
        } else {
            LedgerError::ChannelUnavailable(e.to_string())
        }
    }
}

#[async_trait]
impl LedgerTransport for HttpLedgerTransport {
    async fn submit(
        &self,
        channel: &str,
        chaincode: &str,
        function: &str,
        args: &[String],
    ) -> Result<String, LedgerError> {
        let resp = self
            .client
            .post(self.chaincode_url(channel, chaincode, "transactions"))
            .header("x-user-id", &self.user_id)
            .header("x-msp-id", &self.msp_id)
            .json(&json!({"function": function, "args": args}))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !resp.status().is_success() {
            return Err(Self::map_error(resp, function).await);
        }
        let body: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::ChaincodeError(format!("submit response: {e}")))?;
        Ok(body.tx_id)
    }

    async fn evaluate(
        &self,
        channel: &str,
        chaincode: &str,
        function: &str,
        args: &[String],
    ) -> Result<Vec<u8>, LedgerError> {
        let resp = self
            .client
            .post(self.chaincode_url(channel, chaincode, "query"))
            .header("x-user-id", &self.user_id)
            .header("x-msp-id", &self.msp_id)
            .json(&json!({"function": function, "args": args}))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !resp.status().is_success() {
            return Err(Self::map_error(resp, function).await);
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| LedgerError::ChaincodeError(format!("evaluate body: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn open_event_stream(
        &self,
        channel: &str,
        chaincode: &str,
    ) -> Result<mpsc::Receiver<RawEvent>, LedgerError> {
        let (tx, rx) = mpsc::channel(256);
        let client = self.client.clone();
        let url = self.chaincode_url(channel, chaincode, "events");
        tokio::spawn(async move {
            let mut cursor = 0u64;
            loop {
                let poll = client
                    .get(&url)
                    .query(&[("since", cursor.to_string())])
                    .send()
                    .await;
                match poll {
                    Ok(resp) if resp.status().is_success() => {
                        match resp.json::<Vec<EventEnvelope>>().await {
                            Ok(envelopes) => {
                                cursor += envelopes.len() as u64;
                                for envelope in envelopes {
                                    let raw = RawEvent {
                                        name: envelope.name,
                                        payload: envelope.payload.to_string().into_bytes(),
                                        tx_id: envelope.tx_id,
                                    };
                                    if tx.send(raw).await.is_err() {
                                        debug!("event receiver dropped; stopping poll loop");
                                        return;
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "bad event poll body"),
                        }
                    }
                    Ok(resp) => warn!(status = %resp.status(), "event poll rejected"),
                    Err(e) => warn!(error = %e, "event poll failed"),
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        Ok(rx)
    }

    async fn ping(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
